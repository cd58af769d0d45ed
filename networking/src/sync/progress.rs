use serde::{Deserialize, Serialize};

use crate::serde_utils::quantity;

/// Snapshot of sync progress. Counters only move forward while a session
/// runs; `starting_block` is reset when a new session starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(with = "quantity")]
    pub starting_block: u64,
    #[serde(with = "quantity")]
    pub current_block: u64,
    #[serde(with = "quantity")]
    pub highest_block: u64,
    #[serde(with = "quantity")]
    pub pulled_states: u64,
    #[serde(with = "quantity")]
    pub known_states: u64,
}

impl Progress {
    pub fn advance_current(&mut self, number: u64) {
        self.current_block = self.current_block.max(number);
    }

    pub fn advance_highest(&mut self, number: u64) {
        self.highest_block = self.highest_block.max(number);
    }

    pub fn record_states(&mut self, pulled: u64, known: u64) {
        self.pulled_states = self.pulled_states.max(pulled);
        self.known_states = self.known_states.max(known);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_never_move_back() {
        let mut progress = Progress::default();
        progress.advance_current(10);
        progress.advance_current(4);
        progress.advance_highest(50);
        progress.advance_highest(20);
        assert_eq!(progress.current_block, 10);
        assert_eq!(progress.highest_block, 50);

        progress.record_states(7, 20);
        progress.record_states(5, 12);
        assert_eq!((progress.pulled_states, progress.known_states), (7, 20));
    }

    #[test]
    fn serializes_hex_quantities() {
        let progress = Progress {
            current_block: 150,
            highest_block: 150,
            ..Default::default()
        };
        let json = serde_json::to_value(progress).unwrap();
        assert_eq!(json["currentBlock"], "0x96");
        assert_eq!(json["highestBlock"], "0x96");
        assert_eq!(json["startingBlock"], "0x0");
        assert_eq!(serde_json::from_value::<Progress>(json).unwrap(), progress);
    }

    #[test]
    fn reads_numbers_and_rejects_bad_quantities() {
        let json = r#"{"startingBlock":"0x0","currentBlock":7,"highestBlock":"0xff","pulledStates":"0x1","knownStates":"0x2"}"#;
        let progress: Progress = serde_json::from_str(json).unwrap();
        assert_eq!(progress.current_block, 7);
        assert_eq!(progress.highest_block, 255);

        for bad in [r#""255""#, r#""0x""#, r#""0x0ff""#, r#""0xzz""#] {
            let json = format!(
                r#"{{"startingBlock":{bad},"currentBlock":0,"highestBlock":0,"pulledStates":0,"knownStates":0}}"#
            );
            assert!(serde_json::from_str::<Progress>(&json).is_err(), "{bad} accepted");
        }
    }
}
