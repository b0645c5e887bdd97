//! Stream engine context
//!
//! Thin request/reply wrapper over the stream engine's JSON API, plus the
//! constructors for the three consumer flavours. Every call goes through
//! the owning client's request path and inherits its timeout.

use bytes::Bytes;

use crate::connection::Client;
use crate::error::{ConsumerError, Error, ProtocolError, Result};
use crate::jetstream::ordered::OrderedConsumer;
use crate::jetstream::pull::PullConsumer;
use crate::jetstream::push::PushConsumer;
use crate::jetstream::types::{
    ConsumerConfig, ConsumerInfo, DeleteResponse, PubAck, Response, StreamConfig, StreamInfo,
};
use crate::protocol::headers::HeaderMap;
use crate::protocol::Message;

const DEFAULT_API_PREFIX: &str = "$JS.API";

/// Handle to the persistent-stream engine over one connection
#[derive(Debug, Clone)]
pub struct JetStream {
    client: Client,
    prefix: String,
}

impl JetStream {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            prefix: DEFAULT_API_PREFIX.to_string(),
        }
    }

    /// Address the API of a specific stream domain (leaf installations)
    pub fn with_domain(client: Client, domain: impl AsRef<str>) -> Self {
        Self {
            client,
            prefix: format!("$JS.{}.API", domain.as_ref()),
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn api_subject(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    /// Request an API endpoint and decode its enveloped JSON reply
    pub(crate) async fn json_request<T>(&self, subject: String, body: Vec<u8>) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let reply = self.client.request(subject, Bytes::from(body)).await?;
        let response: Response<T> = serde_json::from_slice(&reply.payload).map_err(|e| {
            Error::Protocol(ProtocolError::Parse(format!("invalid api response: {}", e)))
        })?;
        match response {
            Response::Ok(value) => Ok(value),
            Response::Err { error } => Err(Error::Api(error)),
        }
    }

    /// Publish to a stream-bound subject and wait for the storage ack
    pub async fn publish(&self, subject: impl AsRef<str>, payload: Bytes) -> Result<PubAck> {
        self.publish_inner(subject.as_ref(), None, payload).await
    }

    /// Publish with headers and wait for the storage ack
    pub async fn publish_with_headers(
        &self,
        subject: impl AsRef<str>,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<PubAck> {
        self.publish_inner(subject.as_ref(), Some(headers), payload)
            .await
    }

    async fn publish_inner(
        &self,
        subject: &str,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<PubAck> {
        let reply = self.client.request_inner(subject, headers, payload).await?;
        let response: Response<PubAck> = serde_json::from_slice(&reply.payload).map_err(|e| {
            Error::Protocol(ProtocolError::Parse(format!("invalid publish ack: {}", e)))
        })?;
        match response {
            Response::Ok(ack) => Ok(ack),
            Response::Err { error } => Err(Error::Api(error)),
        }
    }

    /// Create a stream, or return the existing one with the same config
    pub async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        validate_name(&config.name)?;
        let subject = self.api_subject(&format!("STREAM.CREATE.{}", config.name));
        let body = serde_json::to_vec(&config)
            .map_err(|e| Error::Protocol(ProtocolError::Parse(e.to_string())))?;
        self.json_request(subject, body).await
    }

    /// Fetch a stream's configuration and state
    pub async fn stream_info(&self, stream: impl AsRef<str>) -> Result<StreamInfo> {
        let stream = stream.as_ref();
        validate_name(stream)?;
        let subject = self.api_subject(&format!("STREAM.INFO.{}", stream));
        self.json_request(subject, Vec::new()).await
    }

    /// Delete a stream and everything stored in it
    pub async fn delete_stream(&self, stream: impl AsRef<str>) -> Result<bool> {
        let stream = stream.as_ref();
        validate_name(stream)?;
        let subject = self.api_subject(&format!("STREAM.DELETE.{}", stream));
        let response: DeleteResponse = self.json_request(subject, Vec::new()).await?;
        Ok(response.success)
    }

    /// Create a consumer on a stream
    ///
    /// A durable name routes to the durable endpoint so the server enforces
    /// name/config agreement with any existing consumer.
    pub async fn create_consumer(
        &self,
        stream: impl AsRef<str>,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        let stream = stream.as_ref();
        validate_name(stream)?;
        let subject = match &config.durable_name {
            Some(durable) => {
                validate_name(durable)?;
                self.api_subject(&format!("CONSUMER.DURABLE.CREATE.{}.{}", stream, durable))
            }
            None => self.api_subject(&format!("CONSUMER.CREATE.{}", stream)),
        };
        let body = serde_json::json!({
            "stream_name": stream,
            "config": config,
        });
        let body = serde_json::to_vec(&body)
            .map_err(|e| Error::Protocol(ProtocolError::Parse(e.to_string())))?;
        self.json_request(subject, body).await
    }

    /// Fetch a consumer's configuration and delivery state
    pub async fn consumer_info(
        &self,
        stream: impl AsRef<str>,
        consumer: impl AsRef<str>,
    ) -> Result<ConsumerInfo> {
        let subject =
            self.api_subject(&format!("CONSUMER.INFO.{}.{}", stream.as_ref(), consumer.as_ref()));
        self.json_request(subject, Vec::new()).await
    }

    /// Delete a consumer
    pub async fn delete_consumer(
        &self,
        stream: impl AsRef<str>,
        consumer: impl AsRef<str>,
    ) -> Result<bool> {
        let subject = self
            .api_subject(&format!("CONSUMER.DELETE.{}.{}", stream.as_ref(), consumer.as_ref()));
        let response: DeleteResponse = self.json_request(subject, Vec::new()).await?;
        Ok(response.success)
    }

    /// Read the newest message for one subject straight from the stream
    ///
    /// Requires `allow_direct` on the stream. Returns `None` when the
    /// subject has no messages.
    pub async fn direct_get_last(
        &self,
        stream: impl AsRef<str>,
        subject: impl AsRef<str>,
    ) -> Result<Option<Message>> {
        let api = self.api_subject(&format!("DIRECT.GET.{}", stream.as_ref()));
        let body = serde_json::json!({ "last_by_subj": subject.as_ref() });
        let body = serde_json::to_vec(&body)
            .map_err(|e| Error::Protocol(ProtocolError::Parse(e.to_string())))?;
        let reply = self.client.request(api, Bytes::from(body)).await?;
        if let Some(status) = reply.status {
            if status == crate::protocol::headers::STATUS_NO_MESSAGES {
                return Ok(None);
            }
            return Err(Error::Protocol(ProtocolError::Parse(format!(
                "direct get failed with status {}",
                status
            ))));
        }
        Ok(Some(reply))
    }

    /// Subscribe to a stream through a push consumer
    ///
    /// A missing `deliver_subject` gets a fresh inbox. The subscription is
    /// installed before the consumer is created so no delivery is missed.
    pub async fn subscribe_push(
        &self,
        stream: impl AsRef<str>,
        mut config: ConsumerConfig,
    ) -> Result<PushConsumer> {
        let deliver_subject = match config.deliver_subject.clone() {
            Some(subject) => subject,
            None => {
                let inbox = self.client.new_inbox();
                config.deliver_subject = Some(inbox.clone());
                inbox
            }
        };
        let subscriber = self.client.subscribe(deliver_subject.clone()).await?;
        let info = self.create_consumer(stream, config).await?;
        Ok(PushConsumer::new(self.clone(), subscriber, info, deliver_subject))
    }

    /// Bind a pull consumer, creating it if needed
    pub async fn pull_consumer(
        &self,
        stream: impl AsRef<str>,
        config: ConsumerConfig,
    ) -> Result<PullConsumer> {
        if config.deliver_subject.is_some() {
            return Err(Error::Consumer(ConsumerError::InvalidConfig(
                "pull consumers cannot have a deliver subject".to_string(),
            )));
        }
        let info = self.create_consumer(stream.as_ref(), config).await?;
        PullConsumer::new(self.clone(), info).await
    }

    /// An ephemeral, self-healing consumer with strict in-order delivery
    ///
    /// Delivery policy and filter from `config` are honored; the ordered
    /// profile (no acks, flow control, heartbeats, memory storage) is
    /// forced on top.
    pub async fn ordered_consumer(
        &self,
        stream: impl AsRef<str>,
        config: ConsumerConfig,
    ) -> Result<OrderedConsumer> {
        OrderedConsumer::create(self.clone(), stream.as_ref().to_string(), config).await
    }
}

/// Stream and consumer names are subject tokens; dots or wildcards would
/// corrupt the API subject they are spliced into
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_ascii_whitespace())
    {
        return Err(Error::Protocol(ProtocolError::InvalidSubject(
            name.to_string(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("orders").is_ok());
        assert!(validate_name("KV_config").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a.b").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("a*").is_err());
        assert!(validate_name(">").is_err());
    }
}
