use crate::models::{Message, Role};

/// Assemble the outbound message sequence from the original conversation
/// and the (possibly cached) CoT text.
///
/// The tail ordering is a hard contract with downstream models: an optional
/// prefill user turn (only when the conversation does not already end on a
/// user turn), then the CoT as the assistant's scratchpad, then the postfill
/// instruction as the final user turn.
pub fn augment_messages(
    original: &[Message],
    cot_text: &str,
    prefill: &str,
    postfill: &str,
) -> Vec<Message> {
    let mut extended = Vec::with_capacity(original.len() + 3);
    extended.extend_from_slice(original);

    if extended.last().map(|m| m.role) != Some(Role::User) {
        extended.push(Message::user(prefill));
    }

    extended.push(Message::assistant(cot_text));
    extended.push(Message::user(postfill));
    extended
}

#[cfg(test)]
mod tests {
    use super::*;

    const COT: &str = "<chain_of_thought>thoughts</chain_of_thought>";

    #[test]
    fn conversation_ending_on_user_skips_prefill() {
        let original = vec![Message::user("Hi")];
        let extended = augment_messages(&original, COT, "[Continue.]", "[Reply.]");

        assert_eq!(extended.len(), 3);
        assert_eq!(extended[0], Message::user("Hi"));
        assert_eq!(extended[1], Message::assistant(COT));
        assert_eq!(extended[2], Message::user("[Reply.]"));
    }

    #[test]
    fn conversation_ending_on_assistant_gets_prefill() {
        let original = vec![
            Message::user("question"),
            Message::assistant("answer"),
        ];
        let extended = augment_messages(&original, COT, "[Continue.]", "[Reply.]");

        assert_eq!(extended.len(), 5);
        assert_eq!(extended[1], Message::assistant("answer"));
        // Prefill sits between the original tail and the CoT block.
        assert_eq!(extended[2], Message::user("[Continue.]"));
        assert_eq!(extended[3], Message::assistant(COT));
        assert_eq!(extended[4], Message::user("[Reply.]"));
    }

    #[test]
    fn empty_conversation_still_ends_cot_then_postfill() {
        let extended = augment_messages(&[], COT, "[Continue.]", "[Reply.]");
        assert_eq!(extended.len(), 3);
        assert_eq!(extended[0], Message::user("[Continue.]"));
        assert_eq!(extended[1], Message::assistant(COT));
        assert_eq!(extended[2], Message::user("[Reply.]"));
    }

    #[test]
    fn tail_is_always_cot_then_postfill() {
        for original in [
            vec![Message::user("a")],
            vec![Message::user("a"), Message::assistant("b")],
            vec![Message::new(Role::System, "sys")],
        ] {
            let extended = augment_messages(&original, COT, "[p]", "[q]");
            let n = extended.len();
            assert_eq!(extended[n - 2], Message::assistant(COT));
            assert_eq!(extended[n - 1], Message::user("[q]"));
        }
    }
}
