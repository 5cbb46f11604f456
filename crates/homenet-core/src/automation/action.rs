//! The action DSL.
//!
//! Actions deserialize from the externally-tagged YAML the catalog uses:
//!
//! ```yaml
//! then:
//!   - send_packet: {data: [0xB0, 0x5A, 0x00, 0x6A]}
//!   - delay: 20s
//!   - command: "id(elevator_call).command_off()"
//!   - if:
//!       condition: "states.door.state == 'open'"
//!       then: [{log: "door open"}]
//! ```

use homenet_proto::Checksum;
use serde::{Deserialize, Serialize};

use crate::DurationValue;

/// One step of a rule's action sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Publish a broker message.
    Publish(PublishAction),
    /// Write a raw frame to the bus.
    SendPacket(SendPacketAction),
    /// Invoke an entity command: `"id(E).command_NAME(arg?)"`.
    Command(String),
    /// Suspend the invocation; cancellable.
    Delay(DurationValue),
    /// Emit a structured log line.
    Log(String),
    /// Conditional branch.
    If(Box<IfAction>),
    /// First matching choice wins.
    Choose(ChooseAction),
    /// Terminate the invocation, propagating through enclosing branches.
    Stop(Option<String>),
    /// Iterate a sub-sequence.
    Repeat(RepeatAction),
}

/// `publish` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishAction {
    /// Broker topic.
    pub topic: String,
    /// Message payload.
    pub payload: String,
    /// Publish retained.
    #[serde(default)]
    pub retain: bool,
}

/// `send_packet` action.
///
/// Either literal `data` bytes or an `expr` evaluated with the current
/// states; an expression may yield a list of payloads, in which case the
/// first is sent and the rest are retry alternatives. `header`, `checksum`,
/// and `footer` dress the payload without touching the bus TX defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendPacketAction {
    /// Literal payload bytes.
    #[serde(with = "homenet_proto::hexfmt::opt", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Expression computing the payload(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    /// Checksum appended over header + payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// Bytes prepended to the payload.
    #[serde(with = "homenet_proto::hexfmt::opt", skip_serializing_if = "Option::is_none")]
    pub header: Option<Vec<u8>>,
    /// Bytes appended after the checksum.
    #[serde(with = "homenet_proto::hexfmt::opt", skip_serializing_if = "Option::is_none")]
    pub footer: Option<Vec<u8>>,
}

/// `if` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfAction {
    /// Condition expression; evaluated with `{states, trigger}`.
    pub condition: String,
    /// Branch taken when truthy.
    pub then: Vec<Action>,
    /// Branch taken when falsy.
    #[serde(default, rename = "else")]
    pub otherwise: Option<Vec<Action>>,
}

/// `choose` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChooseAction {
    /// Ordered choices; the first truthy condition wins.
    pub choices: Vec<Choice>,
    /// Fallback when no choice matches.
    #[serde(default)]
    pub default: Option<Vec<Action>>,
}

/// One arm of a `choose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Arm condition.
    pub condition: String,
    /// Arm actions.
    pub then: Vec<Action>,
}

/// `repeat` action: fixed count, condition, or both (count bounds condition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatAction {
    /// Iteration count.
    #[serde(default)]
    pub times: Option<u64>,
    /// Re-evaluated before each cycle.
    #[serde(default, rename = "while")]
    pub while_condition: Option<String>,
    /// Loop body.
    pub then: Vec<Action>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_action_list() {
        let actions: Vec<Action> = serde_yaml::from_str(
            r#"
            - send_packet: {data: [0xB0, 0x5A, 0x00, 0x6A]}
            - delay: 20s
            - command: "id(elevator_call).command_off()"
            - log: "called"
            - stop: "done"
            "#,
        )
        .unwrap();
        assert_eq!(actions.len(), 5);
        assert!(matches!(
            &actions[0],
            Action::SendPacket(SendPacketAction { data: Some(data), .. })
                if data == &vec![0xB0, 0x5A, 0x00, 0x6A]
        ));
        assert!(matches!(&actions[1], Action::Delay(d) if d.0.as_secs() == 20));
        assert!(matches!(&actions[4], Action::Stop(Some(reason)) if reason == "done"));
    }

    #[test]
    fn nested_flow_control() {
        let actions: Vec<Action> = serde_yaml::from_str(
            r#"
            - if:
                condition: "states.door.state == 'open'"
                then:
                  - publish: {topic: "alert", payload: "open"}
                else:
                  - choose:
                      choices:
                        - condition: "1"
                          then: [{log: "one"}]
                      default: [{stop: ~}]
            - repeat:
                times: 3
                then: [{delay: 10ms}]
            "#,
        )
        .unwrap();
        let Action::If(if_action) = &actions[0] else {
            panic!("expected if");
        };
        assert_eq!(if_action.then.len(), 1);
        assert!(if_action.otherwise.is_some());
        assert!(matches!(&actions[1], Action::Repeat(r) if r.times == Some(3)));
    }
}
