tonic::include_proto!("log.v1");

impl From<crate::types::Record> for Record {
    fn from(record: crate::types::Record) -> Self {
        Record {
            value: record.value,
            offset: record.offset,
        }
    }
}

impl From<Record> for crate::types::Record {
    fn from(record: Record) -> Self {
        crate::types::Record {
            value: record.value,
            offset: record.offset,
        }
    }
}

impl From<crate::types::ServerInfo> for Server {
    fn from(server: crate::types::ServerInfo) -> Self {
        Server {
            id: server.id,
            rpc_addr: server.rpc_addr,
            is_leader: server.is_leader,
        }
    }
}
