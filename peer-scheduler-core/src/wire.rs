//! Wire-image encoding for relayed pods (§4.5, §6, §9).
//!
//! `request_id` is field 1 of `PodEnvelope`, typed `fixed32`, which the
//! protobuf wire format always encodes as a 1-byte tag (`0x0d`) followed
//! by 4 little-endian bytes — deterministically the first 5 bytes of
//! any serialized `PodEnvelope`, regardless of what follows. The send
//! path exploits this: a pod is prost-encoded exactly once per
//! destination fan-out, and each stream's distinct `request_id` is
//! patched into those first 5 bytes in place, with no re-marshalling.

pub mod proto {
    tonic::include_proto!("peer_scheduler.v1");
}

use prost::Message;

use crate::types::Pod;

/// Tag byte for a `fixed32` value in protobuf field 1
/// (`field_number << 3 | wire_type`, `wire_type` 5 for 32-bit).
const REQUEST_ID_TAG: u8 = 0x0d;

/// Byte length of the `request_id` prefix emitted by field 1.
pub const REQUEST_ID_PREFIX_LEN: usize = 5;

/// Encodes `pod` as a `PodEnvelope` with `request_id` left at 0. The
/// caller patches in the real id per-destination via [`set_request_id`].
pub fn encode_pod_envelope(pod: &Pod) -> Vec<u8> {
    let envelope = proto::PodEnvelope {
        request_id: 0,
        pod: Some(proto::PodMessage {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            uid: pod.uid.clone(),
            scheduler_name: pod.scheduler_name.clone(),
            spec: pod.spec.clone(),
        }),
    };
    envelope.encode_to_vec()
}

/// Overwrites the first 5 bytes of a wire-image produced by
/// [`encode_pod_envelope`] with `{tag=0x0d, request_id as LE u32}`.
///
/// Panics if `buf` is shorter than [`REQUEST_ID_PREFIX_LEN`] — every
/// caller only ever invokes this on a buffer it just got back from
/// `encode_pod_envelope`, which always emits the tag whether or not
/// `request_id` is zero (proto3 still emits explicit `fixed32` fields
/// at their default value because they're plain scalars, not
/// `optional`).
pub fn set_request_id(buf: &mut [u8], request_id: u32) {
    assert!(buf.len() >= REQUEST_ID_PREFIX_LEN, "wire image too short for request_id prefix");
    buf[0] = REQUEST_ID_TAG;
    buf[1..5].copy_from_slice(&request_id.to_le_bytes());
}

/// Reads the `request_id` back out of a prefix written by
/// [`set_request_id`], without decoding the rest of the message.
pub fn decode_request_id(buf: &[u8]) -> Option<u32> {
    if buf.len() < REQUEST_ID_PREFIX_LEN || buf[0] != REQUEST_ID_TAG {
        return None;
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[1..5]);
    Some(u32::from_le_bytes(bytes))
}

/// Decodes a full `PodEnvelope`, used on the receiving relay's side
/// where the rest of the message is needed, not just the prefix.
pub fn decode_pod_envelope(buf: &[u8]) -> Result<proto::PodEnvelope, prost::DecodeError> {
    proto::PodEnvelope::decode(buf)
}
