//! MESSAGE client (RFC 3428): pager-mode instant messages, one
//! non-INVITE transaction per message.

use crate::core::{RequestOptions, ResponseWaiter, UserAgentCore};
use crate::error::{Error, Result};
use crate::message::{Body, Method, Uri};

/// Sends pager-mode messages to one target.
pub struct Messager {
    core: UserAgentCore,
    target: Uri,
    content_type: String,
}

impl Messager {
    pub fn new(core: UserAgentCore, target: Uri, content_type: impl Into<String>) -> Self {
        Messager {
            core,
            target,
            content_type: content_type.into(),
        }
    }

    /// Sends one MESSAGE; resolves on the 2xx, rejects on any final
    /// failure.
    pub async fn message(&self, content: impl Into<String>) -> Result<()> {
        let options = RequestOptions {
            body: Some(Body::new(self.content_type.clone(), content.into())),
            ..Default::default()
        };
        let request = self
            .core
            .make_request(Method::Message, self.target.clone(), options);

        let (waiter, done) = ResponseWaiter::new();
        self.core.request(request, Some(waiter)).await?;
        match done.await {
            Ok(Ok(response)) if response.status.is_success() => Ok(()),
            Ok(Ok(response)) => Err(Error::RequestFailure {
                code: response.status,
                reason: response.reason,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreConfig;
    use crate::message::{parse_message, Response};
    use crate::test_utils::connected_transport;
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_message_resolves_on_200() {
        let (transport, server) = connected_transport().await;
        let core = UserAgentCore::new(CoreConfig::default(), transport);
        let target: Uri = "sip:bob@example.com".parse().unwrap();
        let messager = Messager::new(core.clone(), target, "text/plain");

        let handle = tokio::spawn(async move { messager.message("hello").await });
        time::sleep(Duration::from_millis(10)).await;

        let frame = server.last_frame().unwrap();
        assert!(frame.starts_with("MESSAGE sip:bob@example.com"));
        assert!(frame.ends_with("hello"));

        let parsed = parse_message(&frame).unwrap();
        let response = Response::reply_to(parsed.as_request().unwrap(), 200);
        core.receive_message(response.encode());

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_message_rejects_on_failure() {
        let (transport, server) = connected_transport().await;
        let core = UserAgentCore::new(CoreConfig::default(), transport);
        let target: Uri = "sip:bob@example.com".parse().unwrap();
        let messager = Messager::new(core.clone(), target, "text/plain");

        let handle = tokio::spawn(async move { messager.message("hello").await });
        time::sleep(Duration::from_millis(10)).await;

        let frame = server.last_frame().unwrap();
        let parsed = parse_message(&frame).unwrap();
        let response = Response::reply_to(parsed.as_request().unwrap(), 480);
        core.receive_message(response.encode());

        assert_matches!(
            handle.await.unwrap().unwrap_err(),
            Error::RequestFailure { .. }
        );
    }
}
