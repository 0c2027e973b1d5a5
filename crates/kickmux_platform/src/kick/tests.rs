#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kickmux_domain::{LiveStatus, RoomId, RoomRegistration};
use proptest::prelude::*;
use serde_json::json;

use super::*;
use crate::protocol::{InboundFrame, ProviderProtocol, SubscriptionKey};
use crate::EventKind;

fn room(id: &str) -> RoomRegistration {
	RoomRegistration::new(RoomId::new(id).unwrap(), format!("slug{id}"))
}

#[test]
fn handshake_reads_socket_id_from_string_data() {
	let protocol = PusherProtocol::default();
	let frame = protocol
		.decode(r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"123.456\",\"activity_timeout\":120}"}"#)
		.unwrap();
	assert_eq!(
		frame,
		InboundFrame::Handshake {
			session_id: "123.456".to_string()
		}
	);

	let frame = protocol
		.decode(r#"{"event":"pusher:connection_established","data":{"socket_id":"9.9"}}"#)
		.unwrap();
	assert_eq!(
		frame,
		InboundFrame::Handshake {
			session_id: "9.9".to_string()
		}
	);

	assert!(protocol
		.decode(r#"{"event":"pusher:connection_established","data":"{}"}"#)
		.is_err());
}

#[test]
fn decodes_lifecycle_frames() {
	let protocol = PusherProtocol::default();
	assert_eq!(protocol.decode(r#"{"event":"pusher:ping","data":{}}"#).unwrap(), InboundFrame::Ping);
	assert_eq!(
		protocol
			.decode(r#"{"event":"pusher_internal:subscription_succeeded","data":"{}","channel":"chatrooms.1.v2"}"#)
			.unwrap(),
		InboundFrame::SubscriptionAck {
			key: Some(SubscriptionKey::new("chatrooms.1.v2"))
		}
	);
	assert!(matches!(
		protocol
			.decode(r#"{"event":"pusher:error","data":{"code":4200,"message":"Generic reconnect immediately"}}"#)
			.unwrap(),
		InboundFrame::ReconnectRequested { .. }
	));
	assert!(matches!(
		protocol
			.decode(r#"{"event":"pusher:error","data":{"code":4009,"message":"Connection is unauthorized"}}"#)
			.unwrap(),
		InboundFrame::ServerError { .. }
	));
	assert!(protocol.decode("not json").is_err());
}

#[test]
fn decodes_application_event_with_prefix() {
	let protocol = PusherProtocol::default();
	let frame = protocol
		.decode(r#"{"event":"App\\Events\\ChatMessageEvent","data":"{\"id\":\"m1\",\"content\":\"hi\"}","channel":"chatrooms.7.v2"}"#)
		.unwrap();

	let InboundFrame::Event { route, kind, payload } = frame else {
		panic!("expected event");
	};
	assert_eq!(route, Some(SubscriptionKey::new("chatrooms.7.v2")));
	assert_eq!(kind, EventKind::Kick(KickEvent::ChatMessage));
	assert_eq!(payload["content"], "hi");

	assert_eq!(
		KickEvent::from_name("App\\Events\\SomethingNew"),
		KickEvent::Unknown("SomethingNew".to_string())
	);
}

#[test]
fn encodes_subscribe_and_pong() {
	let protocol = PusherProtocol::default();
	let frame: serde_json::Value =
		serde_json::from_str(&protocol.encode_subscribe(&"chatrooms.1.v2".to_string(), None).unwrap()).unwrap();
	assert_eq!(
		frame,
		json!({"event": "pusher:subscribe", "data": {"auth": "", "channel": "chatrooms.1.v2"}})
	);

	let frame: serde_json::Value = serde_json::from_str(
		&protocol
			.encode_subscribe(&"private-livestream.9".to_string(), Some("key:sig"))
			.unwrap(),
	)
	.unwrap();
	assert_eq!(frame["data"]["auth"], "key:sig");

	let frame: serde_json::Value =
		serde_json::from_str(&protocol.encode_unsubscribe(&"chatroom_1".to_string()).unwrap()).unwrap();
	assert_eq!(frame, json!({"event": "pusher:unsubscribe", "data": {"channel": "chatroom_1"}}));

	assert_eq!(protocol.encode_pong().as_deref(), Some(r#"{"event":"pusher:pong","data":{}}"#));
}

#[test]
fn topics_follow_room_metadata() {
	let protocol = PusherProtocol::default().with_user_id(Some("55".to_string()));
	let mut r = room("1");
	r.channels.channel_id = Some("10".to_string());

	assert_eq!(protocol.room_topics(&r), vec!["chatrooms.1.v2", "chatroom_1", "channel.10"]);
	assert!(protocol.status_topics(&r).is_empty());

	r.apply_live_status(&LiveStatus::Live {
		livestream_id: Some("900".to_string()),
		title: None,
		viewer_count: None,
	});
	assert_eq!(protocol.status_topics(&r), vec!["private-livestream.900"]);
	assert!(protocol.requires_auth(&"private-livestream.900".to_string()));
	assert!(!protocol.requires_auth(&"chatroom_1".to_string()));

	assert_eq!(protocol.global_topics(), vec!["private-userfeed.55"]);
	assert!(PusherProtocol::default().with_user_id(Some(" ".to_string())).global_topics().is_empty());
}

#[test]
fn parses_channel_names() {
	assert_eq!(parse_channel("chatrooms.12.v2"), Some(ChannelRef::Chatroom("12".to_string())));
	assert_eq!(parse_channel("chatrooms.12"), Some(ChannelRef::Chatroom("12".to_string())));
	assert_eq!(parse_channel("rooms.12.v2"), Some(ChannelRef::Chatroom("12".to_string())));
	assert_eq!(parse_channel("chatroom_12"), Some(ChannelRef::Chatroom("12".to_string())));
	assert_eq!(parse_channel("channel.4"), Some(ChannelRef::Channel("4".to_string())));
	assert_eq!(parse_channel("private-livestream.8"), Some(ChannelRef::Livestream("8".to_string())));
	assert_eq!(parse_channel("chatrooms.abc.v2"), None);
	assert_eq!(parse_channel("private-userfeed.1"), None);
}

#[test]
fn room_for_key_resolves_through_channel_ids() {
	let protocol = PusherProtocol::default();
	let mut a = room("1");
	a.channels.channel_id = Some("100".to_string());
	a.channels.livestream_id = Some("500".to_string());
	let rooms = BTreeMap::from([(a.room_id.clone(), a)]);

	let resolve = |key: &str| protocol.room_for_key(&SubscriptionKey::new(key), &rooms);
	assert_eq!(resolve("chatrooms.1"), Some(RoomId::new("1").unwrap()));
	assert_eq!(resolve("channel.100"), Some(RoomId::new("1").unwrap()));
	assert_eq!(resolve("private-livestream.500"), Some(RoomId::new("1").unwrap()));
	assert_eq!(resolve("chatrooms.2.v2"), None);
}

#[test]
fn parses_event_payloads() {
	let room_id = RoomId::new("7").unwrap();
	let message = parse_chat_message(
		&room_id,
		&json!({
			"id": "abc",
			"chatroom_id": 7,
			"content": "hello",
			"created_at": "2024-01-01T00:00:00Z",
			"sender": { "id": 42, "username": "Someone", "slug": "someone" },
			"metadata": {
				"original_sender": { "username": "Other" },
				"original_message": { "id": "prev", "content": "first" }
			}
		}),
	)
	.unwrap();
	assert_eq!(message.sender.id, "42");
	assert_eq!(message.reply_to.as_ref().map(|r| r.message_id.as_str()), Some("prev"));

	let pinned = parse_pinned_change(
		&KickEvent::PinnedMessageCreated,
		&room_id,
		&json!({
			"message": { "id": "p1", "content": "pinned", "sender": { "id": "1", "username": "mod" } },
			"duration": "1200",
			"pinnedBy": { "username": "mod" }
		}),
	)
	.unwrap()
	.unwrap();
	assert_eq!(pinned.duration_secs, Some(1200));
	assert_eq!(pinned.message.room_id, room_id);
	assert_eq!(
		parse_pinned_change(&KickEvent::PinnedMessageDeleted, &room_id, &json!({})),
		Some(None)
	);

	let live = parse_live_status(
		&KickEvent::StreamerIsLive,
		&json!({ "livestream": { "id": 99, "session_title": "title" } }),
	)
	.unwrap();
	assert_eq!(
		live,
		LiveStatus::Live {
			livestream_id: Some("99".to_string()),
			title: Some("title".to_string()),
			viewer_count: None
		}
	);
	assert_eq!(
		parse_live_status(&KickEvent::StopStreamBroadcast, &json!({})),
		Some(LiveStatus::Offline)
	);
	assert_eq!(parse_live_status(&KickEvent::ChatMessage, &json!({})), None);
}

proptest! {
	#[test]
	fn chatroom_channels_round_trip(id in 1u64..u64::MAX) {
		let expected = Some(ChannelRef::Chatroom(id.to_string()));
		prop_assert_eq!(parse_channel(&format!("chatrooms.{id}.v2")), expected.clone());
		prop_assert_eq!(parse_channel(&format!("chatroom_{id}")), expected);
	}
}
