use crate::macros::{impl_as_str, impl_display, impl_from_string};
use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::{sync::Arc, time::Duration};
use strum::IntoStaticStr;

impl_as_str!(SubscriptionId, AccountId, PageToken, MessageId, ThreadId, LabelId);
impl_display!(SubscriptionId, AccountId, MessageId, ThreadId, LabelId);
impl_from_string!(SubscriptionId, AccountId, PageToken, MessageId, ThreadId, LabelId);

// gmail is inconsistent about padding in base64url payloads
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Identifies one newsletter, i.e. one tracked Gmail label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct SubscriptionId(Arc<str>);

/// Key under which a set of OAuth tokens is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AccountId(Arc<str>);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageToken(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct MessageId(Arc<str>);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ThreadId(String);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LabelId(String);

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub label_id: LabelId,
    pub interval: Duration,
}

/// Newest Gmail internal (delivery) date already synced for a subscription.
/// `after:` searches filter on that date, never on the `Date` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HighWaterMark(pub DateTime<Utc>);

impl HighWaterMark {
    /// Gmail search clause selecting mail at or after the mark. `after:` has
    /// second granularity and is exclusive, so the boundary second is
    /// included and already-synced messages are filtered by id.
    pub fn search_query(&self) -> String {
        format!("after:{}", self.0.timestamp() - 1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    // omitted entirely when the label has no matches
    #[serde(default)]
    pub messages: Vec<MinimalMessage>,
    pub next_page_token: Option<PageToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub label_ids: Vec<LabelId>,
    #[serde(default)]
    pub snippet: String,
    #[serde(deserialize_with = "deserialize_unix_ts_str")]
    pub internal_date: DateTime<Utc>,
    #[serde(default)]
    pub size_estimate: usize,
    pub payload: MessagePart,
}

fn deserialize_unix_ts_str<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = <&str>::deserialize(deserializer)?;
    let millis: i64 = s.parse().map_err(serde::de::Error::custom)?;
    let dt = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| serde::de::Error::custom("invalid range"))?;
    Ok(dt)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: MessagePartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePartBody {
    #[serde(default)]
    pub size: usize,
    #[serde(default, deserialize_with = "deserialize_optional_base64")]
    pub data: Option<Vec<u8>>,
}

fn deserialize_optional_base64<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(s) = <Option<&str>>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let data = GMAIL_BASE64.decode(s).map_err(serde::de::Error::custom)?;
    Ok(Some(data))
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct LabelList {
    #[serde(default)]
    pub labels: Vec<MinimalLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalLabel {
    pub id: LabelId,
    pub name: String,
    pub r#type: LabelType,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "lowercase")]
pub enum LabelType {
    System,
    User,
}

/// A message as handed to storage: headers resolved and bodies decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub subject: String,
    pub sender_name: Option<String>,
    pub sender_email: String,
    /// From the `Date` header, for display.
    pub received_at: DateTime<Utc>,
    /// When Gmail accepted the message.
    pub internal_date: DateTime<Utc>,
    pub snippet: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub size_bytes: usize,
}

impl From<FullMessage> for MessageContent {
    fn from(message: FullMessage) -> Self {
        let header = |name: &str| {
            message
                .payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        };

        let subject = header("subject")
            .map(str::to_owned)
            .unwrap_or_else(|| "(No Subject)".to_owned());
        let (sender_name, sender_email) = parse_from_header(header("from").unwrap_or_default());
        let received_at = header("date")
            .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or(message.internal_date);

        let mut bodies = Bodies::default();
        bodies.collect(&message.payload);

        Self {
            id: message.id,
            thread_id: message.thread_id,
            subject,
            sender_name,
            sender_email,
            received_at,
            internal_date: message.internal_date,
            snippet: message.snippet,
            body_text: bodies.text,
            body_html: bodies.html,
            size_bytes: message.size_estimate,
        }
    }
}

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
}

impl Bodies {
    // depth first, the first part of each kind wins
    fn collect(&mut self, part: &MessagePart) {
        if let Some(data) = &part.body.data {
            let slot = match part.mime_type.as_str() {
                "text/plain" => Some(&mut self.text),
                "text/html" => Some(&mut self.html),
                _ => None,
            };
            if let Some(slot) = slot.filter(|slot| slot.is_none()) {
                *slot = Some(String::from_utf8_lossy(data).into_owned());
            }
        }
        for sub_part in &part.parts {
            self.collect(sub_part);
        }
    }
}

/// Splits `"Name" <user@host>` into its display name and address.
fn parse_from_header(value: &str) -> (Option<String>, String) {
    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>')) {
        if open < close {
            let name = value[..open].trim().trim_matches('"').trim();
            let email = value[open + 1..close].trim();
            let name = (!name.is_empty()).then(|| name.to_owned());
            return (name, email.to_owned());
        }
    }
    (None, value.trim().to_owned())
}
