//! MQTT 3.1.1 wire protocol
//!
//! - `codec`: control packet encoders and the incremental decoder
//! - `topics`: topic-filter matching and topic validation

pub mod codec;
pub mod topics;

pub use codec::{
    decode_incremental, CodecError, ConnectInfo, LastWill, Packet, PublishInfo, QoS,
    SubscribeInfo,
};
pub use topics::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};
