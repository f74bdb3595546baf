//! Subject resolution and access control for the log service.

use std::path::Path;
use std::sync::Arc;

use casbin::{CoreApi, DefaultModel, Enforcer, FileAdapter};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::error::AuthError;

/// Request metadata key carrying the caller's identity.
pub const SUBJECT_METADATA_KEY: &str = "x-subject";
/// Object every log request is authorized against.
pub const OBJECT_WILDCARD: &str = "*";
pub const PRODUCE_ACTION: &str = "produce";
pub const CONSUME_ACTION: &str = "consume";

/// Caller identity, stored in request extensions by [`SubjectInterceptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(pub String);

/// Derives the caller's identity from an incoming request.
pub trait SubjectResolver: Send + Sync + 'static {
    fn resolve(&self, request: &Request<()>) -> Option<String>;
}

/// Reads the subject from the `x-subject` metadata entry.
#[derive(Debug, Clone, Default)]
pub struct MetadataSubjectResolver;

impl SubjectResolver for MetadataSubjectResolver {
    fn resolve(&self, request: &Request<()>) -> Option<String> {
        request
            .metadata()
            .get(SUBJECT_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .filter(|subject| !subject.is_empty())
            .map(str::to_string)
    }
}

/// Resolves the subject of every call before it reaches the service.
#[derive(Clone)]
pub struct SubjectInterceptor {
    resolver: Arc<dyn SubjectResolver>,
}

impl SubjectInterceptor {
    pub fn new(resolver: Arc<dyn SubjectResolver>) -> Self {
        Self { resolver }
    }
}

impl Interceptor for SubjectInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let subject = self
            .resolver
            .resolve(&request)
            .ok_or_else(|| Status::unauthenticated(AuthError::Unauthenticated.to_string()))?;
        request.extensions_mut().insert(Subject(subject));
        Ok(request)
    }
}

pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AuthError>;
}

/// Permits everything.
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _subject: &str, _object: &str, _action: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Access control backed by a casbin model file and policy file.
///
/// Requests are enforced as `(subject, object, action)`; the model's matcher
/// decides how policy lines apply.
pub struct AclAuthorizer {
    enforcer: Enforcer,
}

impl AclAuthorizer {
    pub async fn new(model_file: impl AsRef<Path>, policy_file: impl AsRef<Path>) -> Result<Self, AuthError> {
        let model_file = model_file.as_ref();
        let policy_file = policy_file.as_ref();
        let model = DefaultModel::from_file(model_file)
            .await
            .map_err(|e| AuthError::Policy(format!("failed to load model {:?}: {}", model_file, e)))?;
        let adapter = FileAdapter::new(policy_file.to_path_buf());
        let enforcer = Enforcer::new(model, adapter)
            .await
            .map_err(|e| AuthError::Policy(format!("failed to load policy {:?}: {}", policy_file, e)))?;
        Ok(Self { enforcer })
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AuthError> {
        let allowed = self
            .enforcer
            .enforce((subject, object, action))
            .map_err(|e| AuthError::Policy(e.to_string()))?;
        if allowed {
            Ok(())
        } else {
            Err(AuthError::Denied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}
