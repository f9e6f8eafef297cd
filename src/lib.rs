#![doc = include_str!("../README.md")]

pub mod codec;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod limiter;
pub mod message;
pub mod policy;
pub mod source;
pub mod supervisor;
pub mod transport;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerConfig, ConsumerHook, ConsumerRunError, ConversationHandler,
    DefaultConsumerHook, Routes,
};

#[doc(inline)]
pub use message::{ConversationKey, InboundMessage, OutboundMessage};

#[doc(inline)]
pub use policy::{FailureClass, HandlerError, RetryPolicy};

#[doc(inline)]
pub use transport::{Transport, TransportError};
