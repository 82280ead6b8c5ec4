//! Suggestion chip extraction from chatbot replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    proto_value::{unwrap_proto_value, ProtoValue},
    types::{lenient, lenient_seq},
};

/// A quick-reply button. Fields are read permissively and may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionChip {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postback: Option<String>,
}

impl SuggestionChip {
    fn from_option(option: &Value) -> Self {
        Self {
            text: option.get("text").and_then(chip_field_text),
            postback: option.get("postback").and_then(chip_field_text),
        }
    }
}

fn chip_field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Whether the node, once unwrapped, would carry `"type": "chips"`. Only looks
/// at the `type` field, so the full unwrap runs for candidate blocks only.
fn declares_chips(node: &Value) -> bool {
    let kind = match ProtoValue::classify(node) {
        ProtoValue::StructValue(fields) | ProtoValue::Object(fields) => {
            fields.get("type").map(unwrap_proto_value)
        }
        ProtoValue::StringValue(payload)
        | ProtoValue::NumberValue(payload)
        | ProtoValue::BoolValue(payload) => payload.get("type").cloned(),
        _ => None,
    };
    kind.as_ref().and_then(Value::as_str) == Some("chips")
}

fn chips_block(unwrapped: &Value) -> Option<Vec<SuggestionChip>> {
    if unwrapped.get("type").and_then(Value::as_str) != Some("chips") {
        return None;
    }
    let options = unwrapped.get("options").and_then(Value::as_array)?;
    if options.is_empty() {
        return None;
    }
    Some(options.iter().map(SuggestionChip::from_option).collect())
}

/// Depth-first search for the first `chips` block in a reply tree.
///
/// Objects are unwrapped before matching, but the search descends into the
/// original (still wrapped) children in document order. Returns `None` when
/// nothing matches.
pub fn extract_suggestions(node: &Value) -> Option<Vec<SuggestionChip>> {
    match node {
        Value::Array(items) => items.iter().find_map(extract_suggestions),
        Value::Object(map) => declares_chips(node)
            .then(|| chips_block(&unwrap_proto_value(node)))
            .flatten()
            .or_else(|| map.values().find_map(extract_suggestions)),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RichPayload {
    #[serde(default)]
    pub rich_content: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentMessage {
    #[serde(default, deserialize_with = "lenient")]
    pub payload: Option<RichPayload>,
}

/// Reply body of the forum chatbot endpoint. Every field is optional, and a
/// field that is `null` or oddly shaped is treated as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotReply {
    #[serde(default, deserialize_with = "lenient")]
    pub fulfillment_text: Option<String>,
    #[serde(default)]
    pub rich_content: Option<Value>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub fulfillment_messages: Vec<FulfillmentMessage>,
    #[serde(default, deserialize_with = "lenient")]
    pub webhook_payload: Option<RichPayload>,
}

/// Chips to render for a reply: `richContent`, then each fulfillment message
/// payload, then the webhook payload. Empty when no source has chips.
pub fn suggestions_from_reply(reply: &BotReply) -> Vec<SuggestionChip> {
    let root = reply.rich_content.as_ref().and_then(extract_suggestions);

    let from_messages = || {
        reply.fulfillment_messages.iter().find_map(|message| {
            message
                .payload
                .as_ref()
                .and_then(|payload| payload.rich_content.as_ref())
                .and_then(extract_suggestions)
        })
    };

    let from_webhook = || {
        reply
            .webhook_payload
            .as_ref()
            .and_then(|payload| payload.rich_content.as_ref())
            .and_then(extract_suggestions)
    };

    root.or_else(from_messages)
        .or_else(from_webhook)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chip(text: &str, postback: &str) -> SuggestionChip {
        SuggestionChip {
            text: Some(text.to_string()),
            postback: Some(postback.to_string()),
        }
    }

    fn wrapped_chips(pairs: &[(&str, &str)]) -> Value {
        let values = pairs
            .iter()
            .map(|(text, postback)| {
                json!({ "structValue": { "fields": {
                    "text": { "stringValue": text },
                    "postback": { "stringValue": postback }
                } } })
            })
            .collect::<Vec<_>>();

        json!({ "structValue": { "fields": {
            "type": { "stringValue": "chips" },
            "options": { "listValue": { "values": values } }
        } } })
    }

    #[test]
    fn matches_chips_wrapped_in_struct_value() {
        let node = json!({ "structValue": { "fields": {
            "type": "chips",
            "options": [{ "text": "A", "postback": "a" }]
        } } });

        assert_eq!(extract_suggestions(&node), Some(vec![chip("A", "a")]));
    }

    #[test]
    fn matches_fully_wrapped_chips() {
        let node = wrapped_chips(&[("Latest topics", "latest"), ("My posts", "mine")]);
        assert_eq!(
            extract_suggestions(&node),
            Some(vec![chip("Latest topics", "latest"), chip("My posts", "mine")])
        );
    }

    #[test]
    fn first_match_wins_in_arrays() {
        let node = json!([
            { "type": "info", "title": "Welcome" },
            { "type": "chips", "options": [{ "text": "First", "postback": "1" }] },
            { "type": "chips", "options": [{ "text": "Second", "postback": "2" }] }
        ]);

        assert_eq!(extract_suggestions(&node), Some(vec![chip("First", "1")]));
    }

    #[test]
    fn nested_rich_content_is_searched_depth_first() {
        let node = json!([[
            { "type": "description", "text": ["Pick a board"] },
            { "wrapper": { "inner": { "type": "chips", "options": [{ "text": "Deep", "postback": "deep" }] } } }
        ]]);

        assert_eq!(extract_suggestions(&node), Some(vec![chip("Deep", "deep")]));
    }

    #[test]
    fn object_keys_are_searched_in_document_order() {
        let node = json!({
            "zeta": { "type": "chips", "options": [{ "text": "Z", "postback": "z" }] },
            "alpha": { "type": "chips", "options": [{ "text": "A", "postback": "a" }] }
        });

        assert_eq!(extract_suggestions(&node), Some(vec![chip("Z", "z")]));
    }

    #[test]
    fn no_match_returns_none() {
        assert_eq!(extract_suggestions(&json!({ "foo": "bar" })), None);
        assert_eq!(extract_suggestions(&Value::Null), None);
        assert_eq!(extract_suggestions(&json!([])), None);
        assert_eq!(extract_suggestions(&json!("chips")), None);
    }

    #[test]
    fn empty_options_are_not_a_match() {
        let lone = json!({ "type": "chips", "options": [] });
        assert_eq!(extract_suggestions(&lone), None);

        let with_sibling = json!([
            { "type": "chips", "options": [] },
            { "type": "chips", "options": [{ "text": "Next", "postback": "next" }] }
        ]);
        assert_eq!(extract_suggestions(&with_sibling), Some(vec![chip("Next", "next")]));
    }

    #[test]
    fn non_array_options_are_not_a_match() {
        let node = json!({ "type": "chips", "options": { "text": "A" } });
        assert_eq!(extract_suggestions(&node), None);
    }

    #[test]
    fn options_are_read_permissively() {
        let node = json!({ "type": "chips", "options": [
            { "text": "Only text" },
            { "postback": "only-postback" },
            { "text": 2, "postback": true },
            "bare string"
        ] });

        assert_eq!(
            extract_suggestions(&node),
            Some(vec![
                SuggestionChip { text: Some("Only text".into()), postback: None },
                SuggestionChip { text: None, postback: Some("only-postback".into()) },
                SuggestionChip { text: Some("2".into()), postback: Some("true".into()) },
                SuggestionChip { text: None, postback: None },
            ])
        );
    }

    #[test]
    fn chip_serialization_omits_missing_fields() {
        let encoded = serde_json::to_value(SuggestionChip {
            text: Some("Hi".into()),
            postback: None,
        })
        .expect("serialize chip");
        assert_eq!(encoded, json!({ "text": "Hi" }));
    }

    #[test]
    fn reply_policy_prefers_root_rich_content() {
        let reply: BotReply = serde_json::from_value(json!({
            "fulfillmentText": "Here you go",
            "richContent": [[{ "type": "chips", "options": [{ "text": "Root", "postback": "root" }] }]],
            "fulfillmentMessages": [{ "payload": { "richContent": [[
                { "type": "chips", "options": [{ "text": "Msg", "postback": "msg" }] }
            ]] } }]
        }))
        .expect("decode reply");

        assert_eq!(suggestions_from_reply(&reply), vec![chip("Root", "root")]);
    }

    #[test]
    fn reply_policy_walks_fulfillment_messages_in_order() {
        let reply: BotReply = serde_json::from_value(json!({
            "fulfillmentMessages": [
                { "text": { "text": ["plain"] } },
                { "payload": { "richContent": [[{ "type": "info" }]] } },
                { "payload": { "richContent": wrapped_chips(&[("Second msg", "two")]) } },
                { "payload": { "richContent": wrapped_chips(&[("Third msg", "three")]) } }
            ],
            "webhookPayload": { "richContent": [{ "type": "chips", "options": [{ "text": "Hook", "postback": "hook" }] }] }
        }))
        .expect("decode reply");

        assert_eq!(suggestions_from_reply(&reply), vec![chip("Second msg", "two")]);
    }

    #[test]
    fn reply_policy_falls_back_to_webhook_payload() {
        let reply: BotReply = serde_json::from_value(json!({
            "richContent": { "foo": "bar" },
            "webhookPayload": { "richContent": [{ "type": "chips", "options": [{ "text": "Hook", "postback": "hook" }] }] }
        }))
        .expect("decode reply");

        assert_eq!(suggestions_from_reply(&reply), vec![chip("Hook", "hook")]);
    }

    #[test]
    fn reply_without_chips_yields_empty_list() {
        let reply: BotReply =
            serde_json::from_value(json!({ "fulfillmentText": "No buttons today" })).expect("decode reply");
        assert!(suggestions_from_reply(&reply).is_empty());
        assert!(suggestions_from_reply(&BotReply::default()).is_empty());
    }

    #[test]
    fn null_and_misshapen_reply_fields_count_as_absent() {
        let reply: BotReply = serde_json::from_value(json!({
            "fulfillmentText": "Hi",
            "fulfillmentMessages": null,
            "webhookPayload": "str"
        }))
        .expect("decode reply");
        assert_eq!(reply.fulfillment_text.as_deref(), Some("Hi"));
        assert!(reply.fulfillment_messages.is_empty());
        assert!(reply.webhook_payload.is_none());

        let reply: BotReply = serde_json::from_value(json!({
            "fulfillmentText": 42,
            "fulfillmentMessages": [
                "text only",
                { "payload": "str" },
                { "payload": null },
                { "payload": { "richContent": [{ "type": "chips", "options": [{ "text": "Ok", "postback": "ok" }] }] } }
            ]
        }))
        .expect("decode reply");
        assert!(reply.fulfillment_text.is_none());
        assert_eq!(reply.fulfillment_messages.len(), 3);
        assert_eq!(suggestions_from_reply(&reply), vec![chip("Ok", "ok")]);
    }

    #[test]
    fn only_blocks_typed_chips_are_unwrapped() {
        assert!(declares_chips(&json!({ "type": "chips" })));
        assert!(declares_chips(&json!({ "structValue": { "fields": { "type": { "stringValue": "chips" } } } })));
        assert!(declares_chips(&json!({ "stringValue": { "type": "chips" } })));
        assert!(!declares_chips(&json!({ "type": "info" })));
        assert!(!declares_chips(&json!({ "listValue": { "values": [{ "type": "chips" }] } })));
        assert!(!declares_chips(&json!(["chips"])));
    }

    #[test]
    fn deeply_wrapped_chips_are_found() {
        let mut node = wrapped_chips(&[("Deep", "deep")]);
        for _ in 0..40 {
            node = json!({ "structValue": { "fields": { "child": node } } });
        }
        assert_eq!(extract_suggestions(&node), Some(vec![chip("Deep", "deep")]));
    }
}
