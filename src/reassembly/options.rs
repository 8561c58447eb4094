//! TCP option checking
//!
//! Validates the option list of each segment: well-formed TLVs, MSS and
//! window scale only on SYN segments, SACK-permitted placement, and
//! monotonically increasing timestamps per direction.

use crate::core::{Direction, TcpInfo};

const KIND_EOL: u8 = 0;
const KIND_NOP: u8 = 1;
const KIND_MSS: u8 = 2;
const KIND_WINDOW_SCALE: u8 = 3;
const KIND_SACK_PERMITTED: u8 = 4;
const KIND_TIMESTAMP: u8 = 8;

fn dir_index(dir: Direction) -> usize {
    match dir {
        Direction::ClientToServer => 0,
        Direction::ServerToClient => 1,
    }
}

/// Per-connection TCP option checker state
#[derive(Debug, Clone, Default)]
pub struct TcpOptionCheck {
    mss: Option<u16>,
    window_scale: [Option<u8>; 2],
    last_timestamp: [Option<u32>; 2],
}

impl TcpOptionCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a segment's options; an error message means reject
    pub fn accept(&mut self, tcp: &TcpInfo, dir: Direction) -> Result<(), String> {
        let idx = dir_index(dir);
        let opts = &tcp.options_raw;
        let mut pos = 0usize;

        while pos < opts.len() {
            let kind = opts[pos];
            match kind {
                KIND_EOL => break,
                KIND_NOP => {
                    pos += 1;
                    continue;
                }
                _ => {}
            }

            if pos + 1 >= opts.len() {
                return Err(format!("truncated option (kind {kind})"));
            }
            let len = opts[pos + 1] as usize;
            if len < 2 || pos + len > opts.len() {
                return Err(format!("invalid option length {len} (kind {kind})"));
            }
            let body = &opts[pos + 2..pos + len];

            match kind {
                KIND_MSS => {
                    if !tcp.flags.syn {
                        return Err("MSS option on non-SYN segment".to_string());
                    }
                    if body.len() != 2 {
                        return Err("malformed MSS option".to_string());
                    }
                    self.mss = Some(u16::from_be_bytes([body[0], body[1]]));
                }
                KIND_WINDOW_SCALE => {
                    if !tcp.flags.syn {
                        return Err("window scale option on non-SYN segment".to_string());
                    }
                    if body.len() != 1 {
                        return Err("malformed window scale option".to_string());
                    }
                    if body[0] > 14 {
                        return Err(format!("window scale {} exceeds maximum", body[0]));
                    }
                    self.window_scale[idx] = Some(body[0]);
                }
                KIND_SACK_PERMITTED => {
                    if !tcp.flags.syn {
                        return Err("SACK-permitted option on non-SYN segment".to_string());
                    }
                }
                KIND_TIMESTAMP => {
                    if body.len() != 8 {
                        return Err("malformed timestamp option".to_string());
                    }
                    let ts_val = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    if let Some(last) = self.last_timestamp[idx] {
                        // Wrap-aware non-decreasing check
                        if ts_val.wrapping_sub(last) > u32::MAX / 2 {
                            return Err(format!("timestamp went backwards ({last} -> {ts_val})"));
                        }
                    }
                    self.last_timestamp[idx] = Some(ts_val);
                }
                _ => {}
            }

            pos += len;
        }

        if let Some(mss) = self.mss {
            if tcp.payload.len() > mss as usize {
                return Err(format!(
                    "segment of {} bytes exceeds MSS {mss}",
                    tcp.payload.len()
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TcpFlags;

    fn seg(syn: bool, options_raw: Vec<u8>, payload_len: usize) -> TcpInfo {
        TcpInfo {
            flags: TcpFlags {
                syn,
                ack: !syn,
                ..Default::default()
            },
            options_raw,
            payload: vec![0; payload_len],
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_options_ok() {
        let mut check = TcpOptionCheck::new();
        assert!(check
            .accept(&seg(false, Vec::new(), 100), Direction::ClientToServer)
            .is_ok());
    }

    #[test]
    fn test_mss_on_syn_then_enforced() {
        let mut check = TcpOptionCheck::new();
        // MSS 512
        let syn = seg(true, vec![2, 4, 0x02, 0x00], 0);
        assert!(check.accept(&syn, Direction::ClientToServer).is_ok());

        let ok = seg(false, Vec::new(), 512);
        assert!(check.accept(&ok, Direction::ClientToServer).is_ok());

        let too_big = seg(false, Vec::new(), 513);
        assert!(check.accept(&too_big, Direction::ClientToServer).is_err());
    }

    #[test]
    fn test_mss_on_data_segment_rejected() {
        let mut check = TcpOptionCheck::new();
        let bad = seg(false, vec![2, 4, 0x05, 0xB4], 0);
        assert!(check.accept(&bad, Direction::ClientToServer).is_err());
    }

    #[test]
    fn test_window_scale_limit() {
        let mut check = TcpOptionCheck::new();
        let ok = seg(true, vec![3, 3, 14], 0);
        assert!(check.accept(&ok, Direction::ClientToServer).is_ok());

        let mut check = TcpOptionCheck::new();
        let bad = seg(true, vec![3, 3, 15], 0);
        assert!(check.accept(&bad, Direction::ClientToServer).is_err());
    }

    #[test]
    fn test_timestamps_must_not_decrease() {
        let mut check = TcpOptionCheck::new();
        let mut opts = vec![8, 10];
        opts.extend_from_slice(&100u32.to_be_bytes());
        opts.extend_from_slice(&0u32.to_be_bytes());
        assert!(check
            .accept(&seg(false, opts, 0), Direction::ClientToServer)
            .is_ok());

        let mut opts = vec![8, 10];
        opts.extend_from_slice(&50u32.to_be_bytes());
        opts.extend_from_slice(&0u32.to_be_bytes());
        assert!(check
            .accept(&seg(false, opts.clone(), 0), Direction::ClientToServer)
            .is_err());

        // Other direction tracks its own clock
        assert!(check
            .accept(&seg(false, opts, 0), Direction::ServerToClient)
            .is_ok());
    }

    #[test]
    fn test_truncated_option() {
        let mut check = TcpOptionCheck::new();
        assert!(check
            .accept(&seg(true, vec![2, 4, 0x02], 0), Direction::ClientToServer)
            .is_err());
        let mut check = TcpOptionCheck::new();
        assert!(check
            .accept(&seg(true, vec![2], 0), Direction::ClientToServer)
            .is_err());
    }

    #[test]
    fn test_nop_padding() {
        let mut check = TcpOptionCheck::new();
        let opts = vec![1, 1, 2, 4, 0x05, 0xB4, 1, 0];
        assert!(check
            .accept(&seg(true, opts, 0), Direction::ClientToServer)
            .is_ok());
    }
}
