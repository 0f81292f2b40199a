//! Dialogue gate evaluator.
//!
//! Interactive threads: an incoming reply is matched against the gate rules
//! of candidate messages in `order_index` order; the first passing message is
//! the response, else the thread's configured fallback, else no response.
//! Selecting a message may set flags on the player (a deterministic effect
//! declared on the message).
//!
//! Leaked threads run no gating: every message whose audience matches the
//! requesting player is visible once delivered, in `order_index` order.
//!
//! Gate rules and flags live in opaque JSON maps. The accessors below are
//! the only typed view into them; nothing else in the engine inspects these
//! maps.

use serde_json::Value;

use questline_common::{Audience, MessageId, PlayerRole};
use questline_store::DialogueMessage;

/// The typed view of a message's `gate_rules` map.
///
/// `keywords`: every listed keyword must appear in the reply
/// (case-insensitive). `required_flags`: every listed flag must be truthy on
/// the player. An empty rule set always passes.
#[derive(Debug, Clone, Default)]
pub struct GateRules {
    pub keywords: Vec<String>,
    pub required_flags: Vec<String>,
}

impl GateRules {
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else { return Self::default() };
        let strings = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items.iter().filter_map(Value::as_str).map(str::to_string).collect()
                })
                .unwrap_or_default()
        };
        Self { keywords: strings("keywords"), required_flags: strings("required_flags") }
    }
}

/// A flag is truthy when present and neither `false` nor `null`.
fn flag_set(flags: &Value, name: &str) -> bool {
    match flags.get(name) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

pub fn gate_passes(rules: &GateRules, reply: &str, flags: &Value) -> bool {
    let reply_lower = reply.to_lowercase();
    rules.keywords.iter().all(|kw| reply_lower.contains(&kw.to_lowercase()))
        && rules.required_flags.iter().all(|f| flag_set(flags, f))
}

fn audience_matches(audience: Audience, role: Option<PlayerRole>) -> bool {
    match audience {
        Audience::Team | Audience::Player => true,
        Audience::Seeker | Audience::Keeper => role.is_some_and(|r| audience.matches_role(r)),
    }
}

/// The thread's fallback response, if one is configured.
pub fn fallback_message_id(thread_config: &Value) -> Option<MessageId> {
    thread_config.get("fallback_message_id").and_then(Value::as_i64)
}

/// Pick the response to an interactive reply: first candidate (in
/// `order_index` order, audience permitting) whose gate passes, else the
/// configured fallback, else nothing.
///
/// `messages` must already be in `order_index` order, as the store returns
/// them.
pub fn select_response<'a>(
    messages: &'a [DialogueMessage],
    role: Option<PlayerRole>,
    reply: &str,
    flags: &Value,
    fallback_id: Option<MessageId>,
) -> Option<&'a DialogueMessage> {
    let gated = messages
        .iter()
        .filter(|m| audience_matches(m.audience, role))
        .find(|m| {
            // Ungated messages are openers, not reply responses.
            m.gate_rules.is_some()
                && gate_passes(&GateRules::from_value(m.gate_rules.as_ref()), reply, flags)
        });

    gated.or_else(|| fallback_id.and_then(|id| messages.iter().find(|m| m.id == id)))
}

/// Merge a message's declared flag effects into the player's flags.
/// Effects are a flat object; keys overwrite.
pub fn apply_flag_effects(flags: &Value, effects: Option<&Value>) -> Value {
    let mut merged = match flags {
        Value::Object(map) => map.clone(),
        _ => Default::default(),
    };
    if let Some(Value::Object(effects)) = effects {
        for (k, v) in effects {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

/// Leaked-thread view: messages whose audience matches the player, in order.
/// `delivered` holds the content block ids already delivered to the player's
/// team or to the player directly.
pub fn visible_leaked<'a>(
    messages: &'a [DialogueMessage],
    role: Option<PlayerRole>,
    delivered: &[i64],
) -> Vec<&'a DialogueMessage> {
    messages
        .iter()
        .filter(|m| audience_matches(m.audience, role) && delivered.contains(&m.content_block_id))
        .collect()
}
