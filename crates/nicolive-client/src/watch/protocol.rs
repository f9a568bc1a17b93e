//! JSON frame vocabulary of the watch channel.
//!
//! Frames are `{"type": ..., "data": ...}` text messages; the discriminated
//! unions below round-trip through `serde_json` without renaming.

use serde::{Deserialize, Serialize};

/// Messages sent from the client to the watch server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WatchSendMessage {
    StartWatching { data: StartWatchingData },
    KeepSeat,
    Pong,
    PostComment { data: PostCommentData },
    GetAkashic { data: GetAkashicData },
    ChangeStream { data: StreamSpec },
    AnswerEnquete { data: AnswerEnqueteData },
    GetTaxonomy,
    GetStreamQualities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWatchingData {
    pub reconnect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    pub quality: StreamQuality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<StreamQuality>,
    pub latency: StreamLatency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chase_play: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCommentData {
    pub text: String,
    /// Centiseconds since `vposBaseTime`.
    pub vpos: i64,
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<CommentColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<CommentSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CommentPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<CommentFont>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAkashicData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chase_play: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEnqueteData {
    /// Choice index, 0..=8.
    pub answer: u8,
}

/// Comment options attached to a `postComment`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentOptions {
    pub color: Option<CommentColor>,
    pub size: Option<CommentSize>,
    pub position: Option<CommentPosition>,
    pub font: Option<CommentFont>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommentColor {
    Named(NamedColor),
    /// `#RRGGBB`, premium accounts only.
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedColor {
    White,
    Red,
    Pink,
    Orange,
    Yellow,
    Green,
    Cyan,
    Blue,
    Purple,
    Black,
    White2,
    Red2,
    Pink2,
    Orange2,
    Yellow2,
    Green2,
    Cyan2,
    Blue2,
    Purple2,
    Black2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentSize {
    Big,
    Medium,
    Small,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentPosition {
    Ue,
    Naka,
    Shita,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentFont {
    Defont,
    Mincho,
    Gothic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamQuality {
    Abr,
    SuperHigh,
    High,
    Normal,
    Low,
    SuperLow,
    AudioOnly,
    AudioHigh,
    BroadcasterHigh,
    BroadcasterLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamLatency {
    Low,
    High,
}

/// Messages received from the watch server.
///
/// Unrecognized frame types map to [`Unknown`](Self::Unknown) so a protocol
/// addition never kills the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WatchReceiveMessage {
    MessageServer { data: MessageServerData },
    Seat { data: SeatData },
    Akashic { data: serde_json::Value },
    Stream { data: serde_json::Value },
    ServerTime { data: serde_json::Value },
    Statistics { data: serde_json::Value },
    Schedule { data: ScheduleData },
    Ping,
    Disconnect { data: DisconnectData },
    Reconnect { data: ReconnectData },
    PostCommentResult { data: serde_json::Value },
    TagUpdated { data: serde_json::Value },
    Taxonomy { data: serde_json::Value },
    StreamQualities { data: serde_json::Value },
    Enquete { data: serde_json::Value },
    Enqueteresult { data: serde_json::Value },
    Moderator { data: serde_json::Value },
    RemoveModerator { data: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageServerData {
    pub view_uri: String,
    /// ISO-8601; the `vpos = 0` reference instant.
    pub vpos_base_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatData {
    pub keep_interval_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleData {
    /// ISO-8601 program begin.
    pub begin: String,
    /// ISO-8601 program end.
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectData {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectData {
    /// Replacement for the `audience_token` query parameter.
    pub audience_token: String,
    pub wait_time_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    Takeover,
    NoPermission,
    EndProgram,
    PingTimeout,
    TooManyConnections,
    TooManyWatchings,
    Crowded,
    MaintenanceIn,
    ServiceTemporarilyUnavailable,
}

impl DisconnectReason {
    /// `END_PROGRAM` is the only non-errorful reason.
    pub fn is_normal(&self) -> bool {
        matches!(self, DisconnectReason::EndProgram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &WatchSendMessage) {
        let json = serde_json::to_string(message).expect("serialize");
        let back: WatchSendMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(&back, message, "round trip changed {json}");
    }

    #[test]
    fn outbound_messages_round_trip() {
        round_trip(&WatchSendMessage::StartWatching {
            data: StartWatchingData {
                reconnect: true,
                stream: Some(StreamSpec {
                    quality: StreamQuality::SuperHigh,
                    limit: None,
                    latency: StreamLatency::Low,
                    chase_play: Some(false),
                }),
            },
        });
        round_trip(&WatchSendMessage::KeepSeat);
        round_trip(&WatchSendMessage::Pong);
        round_trip(&WatchSendMessage::PostComment {
            data: PostCommentData {
                text: "hello".into(),
                vpos: 12345,
                is_anonymous: false,
                color: Some(CommentColor::Named(NamedColor::Red2)),
                size: Some(CommentSize::Small),
                position: Some(CommentPosition::Shita),
                font: Some(CommentFont::Mincho),
            },
        });
        round_trip(&WatchSendMessage::GetAkashic {
            data: GetAkashicData {
                chase_play: Some(true),
            },
        });
        round_trip(&WatchSendMessage::ChangeStream {
            data: StreamSpec {
                quality: StreamQuality::Abr,
                limit: Some(StreamQuality::Normal),
                latency: StreamLatency::High,
                chase_play: None,
            },
        });
        round_trip(&WatchSendMessage::AnswerEnquete {
            data: AnswerEnqueteData { answer: 3 },
        });
        round_trip(&WatchSendMessage::GetTaxonomy);
        round_trip(&WatchSendMessage::GetStreamQualities);
    }

    #[test]
    fn type_discriminators_use_the_wire_names() {
        let json = serde_json::to_value(WatchSendMessage::KeepSeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "keepSeat"}));
        let json = serde_json::to_value(WatchSendMessage::GetStreamQualities).unwrap();
        assert_eq!(json, serde_json::json!({"type": "getStreamQualities"}));
    }

    #[test]
    fn post_comment_wire_shape_matches_the_server_contract() {
        let message = WatchSendMessage::PostComment {
            data: PostCommentData {
                text: "hello".into(),
                vpos: 12345,
                is_anonymous: false,
                color: None,
                size: None,
                position: None,
                font: None,
            },
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"postComment","data":{"text":"hello","vpos":12345,"isAnonymous":false}}"#
        );
    }

    #[test]
    fn custom_color_serializes_as_hex_string() {
        let color = CommentColor::Custom("#1A2B3C".into());
        assert_eq!(serde_json::to_value(&color).unwrap(), "#1A2B3C");
        let named = CommentColor::Named(NamedColor::White2);
        assert_eq!(serde_json::to_value(&named).unwrap(), "white2");
    }

    #[test]
    fn inbound_frames_parse() {
        let frame: WatchReceiveMessage = serde_json::from_str(
            r#"{"type":"messageServer","data":{"viewUri":"https://host/view","vposBaseTime":"2023-11-14T22:13:20.000Z","hashedUserId":"a:xxx"}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            WatchReceiveMessage::MessageServer { ref data }
                if data.view_uri == "https://host/view" && data.hashed_user_id.as_deref() == Some("a:xxx")
        ));

        let frame: WatchReceiveMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, WatchReceiveMessage::Ping);

        let frame: WatchReceiveMessage = serde_json::from_str(
            r#"{"type":"disconnect","data":{"reason":"PING_TIMEOUT"}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            WatchReceiveMessage::Disconnect { data: DisconnectData { reason: DisconnectReason::PingTimeout } }
        ));

        let frame: WatchReceiveMessage = serde_json::from_str(
            r#"{"type":"reconnect","data":{"audienceToken":"B","waitTimeSec":10}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            WatchReceiveMessage::Reconnect { ref data }
                if data.audience_token == "B" && data.wait_time_sec == 10
        ));
    }

    #[test]
    fn unknown_frame_types_are_preserved_not_errors() {
        let frame: WatchReceiveMessage =
            serde_json::from_str(r#"{"type":"somethingNew","data":{"x":1}}"#).unwrap();
        assert_eq!(frame, WatchReceiveMessage::Unknown);
    }

    #[test]
    fn only_end_program_is_a_normal_disconnect() {
        for reason in [
            DisconnectReason::Takeover,
            DisconnectReason::NoPermission,
            DisconnectReason::PingTimeout,
            DisconnectReason::TooManyConnections,
            DisconnectReason::TooManyWatchings,
            DisconnectReason::Crowded,
            DisconnectReason::MaintenanceIn,
            DisconnectReason::ServiceTemporarilyUnavailable,
        ] {
            assert!(!reason.is_normal());
        }
        assert!(DisconnectReason::EndProgram.is_normal());
    }
}
