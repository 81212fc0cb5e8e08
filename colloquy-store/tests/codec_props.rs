//! Property tests for the message codec.

use chrono::{TimeZone, Utc};
use colloquy_store::codec::encode_json;
use colloquy_store::{
    decode, encode, CodecError, Message, MessageMetadata, Role, SessionId, TokenUsage,
};
use proptest::prelude::*;
use uuid::Uuid;

fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::System), Just(Role::User), Just(Role::Assistant)]
}

fn usage() -> impl Strategy<Value = TokenUsage> {
    (0i64..100_000, 0i64..100_000).prop_map(|(input, output)| TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    })
}

/// Mostly free-form keys, occasionally one that collides with a typed field.
fn extra_key() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => "[a-z_]{1,10}",
        1 => prop::sample::select(MessageMetadata::RESERVED_KEYS.to_vec()).prop_map(String::from),
    ]
}

fn metadata() -> impl Strategy<Value = Option<MessageMetadata>> {
    let extra = prop::collection::btree_map(extra_key(), any::<i32>(), 0..3);
    prop::option::of(
        (
            prop::option::of(usage()),
            prop::option::of("[a-z_]{1,12}"),
            prop::option::of("[a-z0-9:.-]{1,16}"),
            prop::option::of(0u64..600_000),
            extra,
        )
            .prop_map(|(usage, stop_reason, model, latency_ms, extra)| MessageMetadata {
                usage,
                stop_reason,
                model,
                provider: None,
                latency_ms,
                extra: extra
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            }),
    )
}

fn message() -> impl Strategy<Value = Message> {
    (
        any::<u128>(),
        any::<u128>(),
        1u64..1_000_000,
        role(),
        ".*",
        0i64..4_000_000_000,
        0u32..1_000_000_000,
        metadata(),
    )
        .prop_map(|(id, session, seq, role, content, secs, nanos, metadata)| {
            let session_id = SessionId::parse(&Uuid::from_u128(session).to_string()).unwrap();
            Message {
                id: Uuid::from_u128(id),
                session_id,
                seq,
                role,
                content,
                created_at: Utc.timestamp_opt(secs, nanos).unwrap(),
                metadata,
            }
        })
}

proptest! {
    #[test]
    fn decode_inverts_encode(m in message()) {
        prop_assert_eq!(decode(encode(&m)).unwrap(), m);
    }

    #[test]
    fn json_round_trip_or_reserved_key_error(m in message()) {
        let reserved = m
            .metadata
            .as_ref()
            .map_or(Ok(()), MessageMetadata::check_reserved_keys);
        match reserved {
            Ok(()) => {
                let raw = serde_json::to_string(&m).unwrap();
                let back: Message = serde_json::from_str(&raw).unwrap();
                prop_assert_eq!(back, m);
            }
            Err(CodecError::ReservedMetadataKey(key)) => {
                prop_assert!(MessageMetadata::RESERVED_KEYS.contains(&key.as_str()));
                prop_assert!(encode_json(&m).is_err());
                prop_assert!(serde_json::to_string(&m).is_err());
            }
            Err(other) => prop_assert!(false, "unexpected error {}", other),
        }
    }
}
