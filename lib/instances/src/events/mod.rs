// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-shot completion events.
//!
//! A [`CompletionEvent`] is owned by whoever finishes an operation; any number
//! of [`CompletionHandle`]s observe it. Handles are awaitable, can be merged
//! with [`merge_completions`], and can gate another event via
//! [`CompletionEvent::trigger_after`].

mod awaiter;
mod event;
mod merge;
mod state;
mod status;

pub use awaiter::EventAwaiter;
pub use event::{CompletionEvent, CompletionHandle};
pub use merge::merge_completions;
pub use status::{EventPoison, EventStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ── Basic lifecycle ──

    #[tokio::test]
    async fn trigger_wakes_waiters() -> anyhow::Result<()> {
        let event = CompletionEvent::new();
        let handle = event.handle();
        assert_eq!(handle.status(), EventStatus::Pending);

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        tokio::task::yield_now().await;

        assert!(event.trigger());
        assert!(!event.trigger());
        waiter.await??;
        assert!(handle.has_triggered());
        Ok(())
    }

    #[tokio::test]
    async fn drop_poisons_pending_event() {
        let handle = {
            let event = CompletionEvent::new();
            event.handle()
        };
        let err = handle.wait().await.unwrap_err();
        assert!(err.reason().contains("dropped"));
        assert_eq!(handle.status(), EventStatus::Poisoned);
    }

    #[tokio::test]
    async fn drop_after_trigger_keeps_ready() -> anyhow::Result<()> {
        let handle = {
            let event = CompletionEvent::new();
            event.trigger();
            event.handle()
        };
        handle.wait().await?;
        assert!(handle.has_triggered());
        Ok(())
    }

    #[test]
    fn ready_handle_is_shared() {
        let a = CompletionHandle::ready();
        let b = CompletionHandle::ready();
        assert!(a.has_triggered());
        assert!(a.same_as(&b));
    }

    // ── Chaining ──

    #[tokio::test]
    async fn trigger_after_follows_precondition() -> anyhow::Result<()> {
        let precondition = CompletionEvent::new();
        let follower = CompletionEvent::new();
        let handle = follower.handle();
        follower.trigger_after(&precondition.handle());

        assert!(!handle.is_complete());
        precondition.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle.wait()).await??;
        Ok(())
    }

    #[tokio::test]
    async fn trigger_after_carries_poison() {
        let precondition = CompletionEvent::new();
        let follower = CompletionEvent::new();
        let handle = follower.handle();
        follower.trigger_after(&precondition.handle());

        precondition.poison("allocation lost");
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.reason(), "allocation lost");
    }

    // ── Merge ──

    #[tokio::test]
    async fn merge_waits_for_all() -> anyhow::Result<()> {
        let events: Vec<_> = (0..3).map(|_| CompletionEvent::new()).collect();
        let merged = merge_completions(events.iter().map(CompletionEvent::handle));

        events[0].trigger();
        events[2].trigger();
        tokio::task::yield_now().await;
        assert!(!merged.is_complete());

        events[1].trigger();
        merged.wait().await?;
        Ok(())
    }

    #[tokio::test]
    async fn merge_accumulates_poison() {
        let a = CompletionEvent::new();
        let b = CompletionEvent::new();
        let merged = merge_completions([a.handle(), b.handle()]);

        a.poison("first");
        b.trigger();
        let err = merged.wait().await.unwrap_err();
        assert!(err.reason().contains("first"));
    }

    #[test]
    fn merge_of_nothing_is_ready() {
        assert!(merge_completions(Vec::new()).has_triggered());
        assert!(merge_completions([CompletionHandle::ready()]).has_triggered());
    }
}
