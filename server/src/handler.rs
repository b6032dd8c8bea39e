use std::{error::Error, future::Future};

use futures_util::future::{self, BoxFuture, FutureExt};

use crate::context::RequestContext;

pub type HandlerError = Box<dyn Error + Send + Sync>;
pub type HandlerResult = Result<Vec<u8>, HandlerError>;

/// Turns one request payload into one response payload.
///
/// Runs only after the handshake and principal extraction succeeded. On
/// error the server logs it and closes the connection with an empty
/// response.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: RequestContext, request: Vec<u8>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: RequestContext, request: Vec<u8>) -> BoxFuture<'static, HandlerResult> {
        self(ctx, request).boxed()
    }
}

/// Answers every request with the caller's subject identifier.
///
/// Anonymous callers get an error, which reaches them as an empty body.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhoAmI;

impl Handler for WhoAmI {
    fn handle(&self, ctx: RequestContext, _request: Vec<u8>) -> BoxFuture<'static, HandlerResult> {
        let result = ctx
            .subject_identifier()
            .map(|subject| subject.as_bytes().to_vec())
            .map_err(HandlerError::from);
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use keyward_common::{principal::extract_from_chain, testing::Pki, SubjectField};
    use uuid::Uuid;

    use super::*;
    use crate::context::AuthError;

    fn context(authenticated: bool) -> RequestContext {
        let principal = authenticated.then(|| {
            let pki = Pki::generate();
            let chain = [pki.client.cert.clone()];
            extract_from_chain(Some(&chain[..]), SubjectField::CommonName).unwrap()
        });
        RequestContext::new(Uuid::new_v4(), "127.0.0.1:40000".parse().unwrap(), principal)
    }

    #[tokio::test]
    async fn who_am_i_returns_subject() {
        let response = WhoAmI.handle(context(true), Vec::new()).await.unwrap();
        assert_eq!(response, b"client1");
    }

    #[tokio::test]
    async fn who_am_i_refuses_anonymous_callers() {
        let err = WhoAmI.handle(context(false), Vec::new()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<AuthError>(), Some(&AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let echo = |_ctx: RequestContext, request: Vec<u8>| async move { Ok::<_, HandlerError>(request) };
        let response = echo.handle(context(false), b"ping".to_vec()).await.unwrap();
        assert_eq!(response, b"ping");
    }
}
