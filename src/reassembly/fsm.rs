//! Simplified TCP state machine
//!
//! Decides whether a segment is on-path for its connection. One FSM per
//! connection, fed with the direction of each segment relative to the
//! originator.

use crate::core::{Direction, TcpFlags};

/// Connection state as tracked by the simple FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Closing,
    ClosedFinal,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpState::Closed => write!(f, "CLOSED"),
            TcpState::SynSent => write!(f, "SYN_SENT"),
            TcpState::SynReceived => write!(f, "SYN_RCVD"),
            TcpState::Established => write!(f, "ESTABLISHED"),
            TcpState::FinWait => write!(f, "FIN_WAIT"),
            TcpState::Closing => write!(f, "CLOSING"),
            TcpState::ClosedFinal => write!(f, "CLOSED_FINAL"),
        }
    }
}

/// Simple per-connection TCP FSM
#[derive(Debug, Clone)]
pub struct TcpFsm {
    state: TcpState,
    allow_missing_init: bool,
}

impl TcpFsm {
    pub fn new(allow_missing_init: bool) -> Self {
        Self {
            state: TcpState::Closed,
            allow_missing_init,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Check a segment against the current state, advancing it when the
    /// segment is on-path. Returns false for rejected segments.
    pub fn check(&mut self, flags: TcpFlags, dir: Direction) -> bool {
        match self.state {
            TcpState::Closed => {
                if flags.is_syn() && dir == Direction::ClientToServer {
                    self.state = TcpState::SynSent;
                    true
                } else if self.allow_missing_init {
                    self.state = TcpState::Established;
                    true
                } else {
                    false
                }
            }
            TcpState::SynSent => {
                if flags.rst {
                    self.state = TcpState::ClosedFinal;
                    true
                } else if flags.is_syn_ack() && dir == Direction::ServerToClient {
                    self.state = TcpState::SynReceived;
                    true
                } else {
                    // SYN retransmission
                    flags.is_syn() && dir == Direction::ClientToServer
                }
            }
            TcpState::SynReceived => {
                if flags.rst {
                    self.state = TcpState::ClosedFinal;
                    true
                } else if flags.ack && dir == Direction::ClientToServer {
                    self.state = if flags.fin {
                        TcpState::FinWait
                    } else {
                        TcpState::Established
                    };
                    true
                } else {
                    // SYN-ACK retransmission
                    flags.is_syn_ack() && dir == Direction::ServerToClient
                }
            }
            TcpState::Established => {
                if flags.rst {
                    self.state = TcpState::ClosedFinal;
                } else if flags.fin {
                    self.state = TcpState::FinWait;
                }
                true
            }
            TcpState::FinWait => {
                if flags.rst {
                    self.state = TcpState::ClosedFinal;
                } else if flags.fin {
                    self.state = TcpState::Closing;
                }
                true
            }
            TcpState::Closing => {
                if flags.rst {
                    self.state = TcpState::ClosedFinal;
                    true
                } else if flags.ack {
                    self.state = TcpState::ClosedFinal;
                    true
                } else {
                    true
                }
            }
            TcpState::ClosedFinal => {
                // Only trailing ACKs are on-path after close
                flags.ack && !flags.syn && !flags.fin && !flags.rst
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syn() -> TcpFlags {
        TcpFlags {
            syn: true,
            ..Default::default()
        }
    }

    fn syn_ack() -> TcpFlags {
        TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    fn ack() -> TcpFlags {
        TcpFlags {
            ack: true,
            ..Default::default()
        }
    }

    fn fin_ack() -> TcpFlags {
        TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    fn rst() -> TcpFlags {
        TcpFlags {
            rst: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_three_way_handshake() {
        let mut fsm = TcpFsm::new(false);
        assert!(fsm.check(syn(), Direction::ClientToServer));
        assert_eq!(fsm.state(), TcpState::SynSent);
        assert!(fsm.check(syn_ack(), Direction::ServerToClient));
        assert_eq!(fsm.state(), TcpState::SynReceived);
        assert!(fsm.check(ack(), Direction::ClientToServer));
        assert_eq!(fsm.state(), TcpState::Established);
    }

    #[test]
    fn test_reject_data_without_syn() {
        let mut fsm = TcpFsm::new(false);
        assert!(!fsm.check(ack(), Direction::ClientToServer));
        assert_eq!(fsm.state(), TcpState::Closed);
    }

    #[test]
    fn test_allow_missing_init() {
        let mut fsm = TcpFsm::new(true);
        assert!(fsm.check(ack(), Direction::ServerToClient));
        assert_eq!(fsm.state(), TcpState::Established);
    }

    #[test]
    fn test_full_close() {
        let mut fsm = TcpFsm::new(true);
        fsm.check(ack(), Direction::ClientToServer);
        assert!(fsm.check(fin_ack(), Direction::ClientToServer));
        assert_eq!(fsm.state(), TcpState::FinWait);
        assert!(fsm.check(fin_ack(), Direction::ServerToClient));
        assert_eq!(fsm.state(), TcpState::Closing);
        assert!(fsm.check(ack(), Direction::ClientToServer));
        assert_eq!(fsm.state(), TcpState::ClosedFinal);
    }

    #[test]
    fn test_trailing_ack_after_close() {
        let mut fsm = TcpFsm::new(true);
        fsm.check(rst(), Direction::ClientToServer);
        assert_eq!(fsm.state(), TcpState::ClosedFinal);
        assert!(fsm.check(ack(), Direction::ServerToClient));
        assert!(!fsm.check(syn(), Direction::ClientToServer));
    }

    #[test]
    fn test_rst_anywhere() {
        let mut fsm = TcpFsm::new(false);
        fsm.check(syn(), Direction::ClientToServer);
        assert!(fsm.check(rst(), Direction::ServerToClient));
        assert_eq!(fsm.state(), TcpState::ClosedFinal);
    }
}
