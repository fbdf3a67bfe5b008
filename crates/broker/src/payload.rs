//! Wire format contract for published payloads.

/// A payload that can travel through the broker.
///
/// Every payload type declares its own wire encoding; there is no blanket
/// implementation, so a type only becomes publishable by opting in.
pub trait WirePayload: Sized + Send + 'static {
    /// MIME type announced in the publish properties.
    const CONTENT_TYPE: &'static str = "application/json";

    /// Encodes the payload into a message body.
    fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error>;

    /// Decodes a payload from a delivered message body.
    fn from_wire(body: &[u8]) -> Result<Self, serde_json::Error>;

    /// Short label for log lines.
    fn describe(&self) -> String;
}
