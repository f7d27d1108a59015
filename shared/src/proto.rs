//! Protobuf wire types exchanged between the client and the server.
//!
//! Written in the same shape `prost-build` emits, so no build script or
//! `protoc` is required.

/// Top-level frame carried by both transports
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(uint64, tag = "1")]
    pub sequence_id: u64,
    #[prost(oneof = "envelope::Payload", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub payload: ::core::option::Option<envelope::Payload>,
}

/// Nested message and enum types in `Envelope`.
pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        Handshake(super::Handshake),
        #[prost(message, tag = "3")]
        HandshakeAck(super::HandshakeAck),
        #[prost(message, tag = "4")]
        Event(super::Event),
        #[prost(message, tag = "5")]
        Close(super::Close),
        #[prost(message, tag = "6")]
        Ping(super::Ping),
        #[prost(message, tag = "7")]
        Pong(super::Pong),
        #[prost(message, tag = "8")]
        Poll(super::Poll),
    }
}

/// First frame sent on every new transport
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    /// Caller-supplied credential, passed through untouched
    #[prost(string, tag = "1")]
    pub credential: ::prost::alloc::string::String,
    /// Namespace path on the server
    #[prost(string, tag = "2")]
    pub path: ::prost::alloc::string::String,
    #[prost(enumeration = "WireTransport", tag = "3")]
    pub transport: i32,
    /// Empty on the first handshake of a session
    #[prost(string, tag = "4")]
    pub session_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeAck {
    #[prost(string, tag = "1")]
    pub session_id: ::prost::alloc::string::String,
    /// Server-suggested ping interval, 0 means "use the client default"
    #[prost(uint64, tag = "2")]
    pub ping_interval_ms: u64,
}

/// Application event, opaque to the connection manager
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Close {
    #[prost(enumeration = "CloseReason", tag = "1")]
    pub reason: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub timestamp_ms: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(uint64, tag = "1")]
    pub timestamp_ms: u64,
}

/// One request/response exchange of the polling transport
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Poll {
    #[prost(string, tag = "1")]
    pub session_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub events: ::prost::alloc::vec::Vec<Event>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireTransport {
    Unknown = 0,
    Polling = 1,
    Stream = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CloseReason {
    Unknown = 0,
    /// Server closed the session on purpose
    Server = 1,
    /// Client is going away
    Client = 2,
    /// Server is moving the session to another transport
    TransportChange = 3,
}
