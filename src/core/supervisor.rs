//! 回合监管：会话级根取消令牌 + 每回合子令牌
//!
//! 回合退役时取消它的令牌，挂在该回合上的并行任务随之协作式取消；关闭时取消根令牌。

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TurnSupervisor {
    root: CancellationToken,
    turn: CancellationToken,
}

impl TurnSupervisor {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let turn = root.child_token();
        Self { root, turn }
    }

    /// 开始新回合：旧回合令牌作废，返回新回合令牌
    pub fn begin_turn(&mut self) -> CancellationToken {
        self.turn.cancel();
        self.turn = self.root.child_token();
        self.turn.clone()
    }

    pub fn retire_turn(&self) {
        self.turn.cancel();
    }

    pub fn turn_token(&self) -> CancellationToken {
        self.turn.clone()
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for TurnSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_turn_cancels_previous() {
        let mut sup = TurnSupervisor::new();
        let first = sup.begin_turn();
        let task = first.child_token();
        let second = sup.begin_turn();
        assert!(first.is_cancelled());
        assert!(task.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let mut sup = TurnSupervisor::new();
        let turn = sup.begin_turn();
        sup.shutdown();
        assert!(sup.is_shutdown());
        assert!(turn.is_cancelled());
    }

    #[test]
    fn test_retire_keeps_root_alive() {
        let mut sup = TurnSupervisor::new();
        let turn = sup.begin_turn();
        sup.retire_turn();
        assert!(turn.is_cancelled());
        assert!(!sup.is_shutdown());
    }
}
