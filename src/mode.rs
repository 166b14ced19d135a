use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// システム全体の動作モード
///
/// AUTO: 在室検知で自動点灯。MANUAL: ジェスチャー操作のみ。
/// 起動時は常にAUTO（再起動でモードは持ち越さない）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    Auto,
    Manual,
}

/// 全ワーカーで共有するモードハンドル
///
/// 確定したジェスチャーだけが書き込み、各ワーカーが判定前に読む。
/// 原子的な load/store のみで順序保証は不要（last-write-wins）。
#[derive(Debug, Clone)]
pub struct SharedMode {
    inner: Arc<AtomicU8>,
}

const MODE_AUTO: u8 = 0;
const MODE_MANUAL: u8 = 1;

impl SharedMode {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(MODE_AUTO)),
        }
    }

    pub fn get(&self) -> SystemMode {
        match self.inner.load(Ordering::Relaxed) {
            MODE_MANUAL => SystemMode::Manual,
            _ => SystemMode::Auto,
        }
    }

    pub fn set(&self, mode: SystemMode) {
        let value = match mode {
            SystemMode::Auto => MODE_AUTO,
            SystemMode::Manual => MODE_MANUAL,
        };
        self.inner.store(value, Ordering::Relaxed);
    }
}

impl Default for SharedMode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_in_auto() {
        let mode = SharedMode::new();
        assert_eq!(mode.get(), SystemMode::Auto);
    }

    #[test]
    fn test_set_is_visible_through_clone() {
        let mode = SharedMode::new();
        let handle = mode.clone();
        handle.set(SystemMode::Manual);
        assert_eq!(mode.get(), SystemMode::Manual);
        handle.set(SystemMode::Auto);
        assert_eq!(mode.get(), SystemMode::Auto);
    }
}
