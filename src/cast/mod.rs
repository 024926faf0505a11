//! Generated protobuf types for the Cast v2 channel envelope.
//!
//! `build.rs` compiles `cast_channel.proto` into `$OUT_DIR/protos`.

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
