//! Wires the concrete codec crates into a [`CodecRegistry`] so a listener's
//! `protocol` name resolves to a [`FrameCodec`] at boot (spec.md §9:
//! "callers register codecs explicitly at boot instead of relying on
//! runtime string-to-class resolution").

use std::sync::Arc;

use wireframe_codec::CodecRegistry;
use wireframe_codec_fastcgi::FastCgiCodec;
use wireframe_codec_http::HttpCodec;
use wireframe_codec_resp::RespCodec;

pub fn builtin_registry() -> CodecRegistry {
    let mut registry = CodecRegistry::new();
    registry.register(Arc::new(RespCodec::new()));
    registry.register(Arc::new(FastCgiCodec::new()));
    registry.register(Arc::new(HttpCodec::new()));
    registry
}
