use std::collections::HashMap;
use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use uuid::Uuid;

use crate::configuration::AuthSettings;
use crate::error::LedgerError;

/// Maps a bearer token to the user it was issued to.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Uuid>;
}

/// Fixed token table, loaded from configuration.
pub struct StaticTokens {
    tokens: HashMap<String, Uuid>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = (String, Uuid)>) -> StaticTokens {
        StaticTokens {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &AuthSettings) -> StaticTokens {
        StaticTokens::new(
            settings
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), entry.user_id)),
        )
    }
}

impl IdentityProvider for StaticTokens {
    fn resolve(&self, token: &str) -> Option<Uuid> {
        self.tokens.get(token).copied()
    }
}

/// Authenticated user behind the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

impl FromRequest for Caller {
    type Error = LedgerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

fn authenticate(req: &HttpRequest) -> Result<Caller, LedgerError> {
    let provider = req
        .app_data::<web::Data<dyn IdentityProvider>>()
        .ok_or(LedgerError::Unauthenticated)?;

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(LedgerError::Unauthenticated)?;

    provider
        .resolve(token)
        .map(Caller)
        .ok_or(LedgerError::Unauthenticated)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::test::TestRequest;

    use super::*;

    fn request(authorization: Option<&str>) -> HttpRequest {
        let user = Uuid::from_u128(7);
        let provider: Arc<dyn IdentityProvider> =
            Arc::new(StaticTokens::new([("secret".to_string(), user)]));
        let mut builder = TestRequest::default().app_data(web::Data::from(provider));
        if let Some(value) = authorization {
            builder = builder.insert_header((header::AUTHORIZATION, value));
        }
        builder.to_http_request()
    }

    #[test]
    fn bearer_tokens_resolve_to_their_user() {
        let caller = authenticate(&request(Some("Bearer secret"))).unwrap();
        assert_eq!(caller, Caller(Uuid::from_u128(7)));
    }

    #[test]
    fn missing_or_unknown_tokens_are_rejected() {
        for header in [None, Some("Bearer nope"), Some("Basic secret"), Some("Bearer ")] {
            assert!(matches!(
                authenticate(&request(header)),
                Err(LedgerError::Unauthenticated)
            ));
        }
    }
}
