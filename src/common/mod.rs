//! 公共工具模块

use std::cell::RefCell;
use std::thread::LocalKey;

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_chars` 个字符的前缀，超出部分以 `...` 标记
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &s[..end]),
        None => s.to_string(),
    }
}

/// 线程局部槽位的作用域守卫
///
/// 进入时替换槽位的值，drop 时恢复之前的值（包括 panic 展开路径）
pub struct LocalScope<T: 'static> {
    key: &'static LocalKey<RefCell<Option<T>>>,
    previous: Option<T>,
}

impl<T: 'static> LocalScope<T> {
    pub fn enter(key: &'static LocalKey<RefCell<Option<T>>>, value: T) -> Self {
        let previous = key.with(|slot| slot.replace(Some(value)));
        Self { key, previous }
    }
}

impl<T: 'static> Drop for LocalScope<T> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // 线程销毁阶段槽位可能已不可用
        let _ = self.key.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    thread_local! {
        static SLOT: RefCell<Option<u32>> = const { RefCell::new(None) };
    }

    fn current() -> Option<u32> {
        SLOT.with(|slot| *slot.borrow())
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("/short", 26), "/short");
        assert_eq!(
            truncate_with_ellipsis("/a/very/long/path/that/keeps/going", 26),
            "/a/very/long/path/that/kee..."
        );
        // 多字节字符不会被截断到一半
        assert_eq!(truncate_with_ellipsis("中文路径测试", 2), "中文...");
    }

    #[test]
    fn test_local_scope_restores_previous() {
        assert_eq!(current(), None);
        {
            let _outer = LocalScope::enter(&SLOT, 1);
            assert_eq!(current(), Some(1));
            {
                let _inner = LocalScope::enter(&SLOT, 2);
                assert_eq!(current(), Some(2));
            }
            assert_eq!(current(), Some(1));
        }
        assert_eq!(current(), None);
    }

    #[test]
    fn test_local_scope_restores_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _scope = LocalScope::enter(&SLOT, 7);
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(current(), None);
    }
}
