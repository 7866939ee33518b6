//! Property tests for the RRAC message codec.

use proptest::prelude::*;

use raconteur_transport::protocol::{
    ElementData, Message, MessageElement, MessageEntry, MessageEntryType, MessageErrorType,
    MessageFlags, MessageHeader, NodeId, WireFormat, FRAME_PREFIX_SIZE,
};

fn name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.]{0,24}"
}

fn element_data() -> impl Strategy<Value = ElementData> {
    let leaf = prop_oneof![
        proptest::collection::vec(any::<f64>().prop_filter("finite", |v| v.is_finite()), 0..8)
            .prop_map(ElementData::Double),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(ElementData::UInt8),
        proptest::collection::vec(any::<i32>(), 0..8).prop_map(ElementData::Int32),
        proptest::collection::vec(any::<u32>(), 0..8).prop_map(ElementData::UInt32),
        proptest::collection::vec(any::<bool>(), 0..8).prop_map(ElementData::Bool),
        "[ -~]{0,32}".prop_map(ElementData::String),
    ];
    leaf.prop_recursive(2, 8, 4, |inner| {
        proptest::collection::vec((name(), inner), 0..4).prop_map(|children| {
            ElementData::Nested(
                children
                    .into_iter()
                    .map(|(n, d)| MessageElement::new(n, d))
                    .collect(),
            )
        })
    })
}

fn entry() -> impl Strategy<Value = MessageEntry> {
    (
        prop_oneof![
            Just(MessageEntryType::FUNCTION_CALL_REQ),
            Just(MessageEntryType::WIRE_PACKET),
            Just(MessageEntryType::EVENT_REQ),
            Just(MessageEntryType::PROPERTY_GET_RES),
        ],
        name(),
        name(),
        any::<u32>(),
        proptest::collection::vec((name(), element_data()), 0..4),
    )
        .prop_map(|(kind, path, member, request_id, elements)| {
            let mut entry = MessageEntry::new(kind, member)
                .with_service_path(path)
                .with_request_id(request_id);
            for (n, d) in elements {
                entry.add_element(MessageElement::new(n, d));
            }
            entry
        })
}

fn message() -> impl Strategy<Value = Message> {
    (
        any::<[u8; 16]>(),
        any::<[u8; 16]>(),
        any::<u32>(),
        any::<u32>(),
        name(),
        name(),
        any::<u16>(),
        proptest::collection::vec(entry(), 0..4),
    )
        .prop_map(|(s, r, se, re, sn, rn, id, entries)| Message {
            header: MessageHeader {
                sender_node_id: NodeId::from_bytes(s),
                receiver_node_id: NodeId::from_bytes(r),
                sender_endpoint: se,
                receiver_endpoint: re,
                sender_node_name: sn,
                receiver_node_name: rn,
                message_id: id,
                ..Default::default()
            },
            entries,
        })
}

proptest! {
    #[test]
    fn prop_encoded_size_matches_compute_size(m in message()) {
        for format in [WireFormat::V2, WireFormat::V4(MessageFlags::FULL), WireFormat::V4(MessageFlags::default())] {
            let bytes = m.encode(format).unwrap();
            prop_assert_eq!(bytes.len(), m.compute_size(format));
            prop_assert!(bytes.len() >= FRAME_PREFIX_SIZE);
        }
    }

    #[test]
    fn prop_full_frames_decode_to_original(m in message()) {
        prop_assert_eq!(&Message::decode(&m.encode(WireFormat::V2).unwrap()).unwrap(), &m);
        prop_assert_eq!(
            &Message::decode(&m.encode(WireFormat::V4(MessageFlags::FULL)).unwrap()).unwrap(),
            &m
        );
    }

    #[test]
    fn prop_compact_frames_drop_only_routing(m in message()) {
        let decoded = Message::decode(&m.encode(WireFormat::V4(MessageFlags::default())).unwrap()).unwrap();
        prop_assert_eq!(&decoded.entries, &m.entries);
        prop_assert_eq!(&decoded.header.sender_node_name, &m.header.sender_node_name);
        prop_assert!(decoded.header.sender_node_id.is_any_node());
        prop_assert_eq!(decoded.header.sender_endpoint, 0);
    }

    #[test]
    fn prop_truncated_frames_are_rejected(m in message(), cut in 1usize..64) {
        let bytes = m.encode(WireFormat::V2).unwrap();
        let keep = bytes.len().saturating_sub(cut);
        prop_assert!(Message::decode(&bytes[..keep]).is_err());
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = Message::decode(&bytes);
    }

    #[test]
    fn prop_error_reply_round_trips(code in prop_oneof![
        Just(MessageErrorType::ProtocolError),
        Just(MessageErrorType::NodeNotFound),
        Just(MessageErrorType::InvalidEndpoint),
    ]) {
        let request = MessageEntry::new(MessageEntryType::FUNCTION_CALL_REQ, "f").with_request_id(3);
        let m = Message::with_entry(MessageHeader::default(), request.error_reply(code, "nope"));
        let decoded = Message::decode(&m.encode(WireFormat::V2).unwrap()).unwrap();
        let err = decoded.entries[0].check_error().unwrap_err();
        prop_assert!(err.to_string().contains("nope"));
    }
}
