/// Message container used by the publish path.
///
/// `Envelope` bundles a payload together with the headers that tell a
/// transport backend where and how to deliver it. It is intentionally
/// generic and transport-agnostic.
///
/// ## Design
///
/// - `H` carries delivery metadata (routing, attempt counters, failure
///   annotations)
/// - `M` carries the payload itself
///
/// Keeping the two separated lets the same payload flow through different
/// destinations (reply queue, retry queue, dead-letter queue) with only the
/// headers changing.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when
/// headers and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use courier::Envelope;
///
/// let envelope = Envelope {
///     headers: "messages.to_send",
///     message: br#"{"content":{"text":{"body":"hi"}}}"#.to_vec(),
/// };
///
/// // or, equivalently
/// let envelope: Envelope<_, _> = ("messages.to_send", vec![0u8]).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Delivery metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}
