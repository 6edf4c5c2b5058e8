// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::sync::Arc;

use super::event::{CompletionEvent, CompletionHandle};
use super::status::Completion;

struct MergeState {
    remaining: usize,
    reasons: Vec<String>,
    event: Option<CompletionEvent>,
}

/// Merge many completions into one that fires after all of them.
///
/// Poison reasons from the inputs are accumulated; the merged completion is
/// poisoned if any input was.
pub fn merge_completions<I>(handles: I) -> CompletionHandle
where
    I: IntoIterator<Item = CompletionHandle>,
{
    let pending: Vec<CompletionHandle> = handles
        .into_iter()
        .filter(|handle| !handle.has_triggered())
        .collect();

    match pending.len() {
        0 => return CompletionHandle::ready(),
        1 => return pending.into_iter().next().unwrap_or_else(CompletionHandle::ready),
        _ => {}
    }

    let event = CompletionEvent::new();
    let merged = event.handle();
    let state = Arc::new(Mutex::new(MergeState {
        remaining: pending.len(),
        reasons: Vec::new(),
        event: Some(event),
    }));

    for handle in pending {
        let state = Arc::clone(&state);
        handle.state.on_complete(Box::new(move |value| {
            let finished = {
                let mut guard = state.lock();
                if let Completion::Poisoned(poison) = value {
                    guard.reasons.push(poison.reason().to_string());
                }
                guard.remaining -= 1;
                if guard.remaining == 0 {
                    guard
                        .event
                        .take()
                        .map(|event| (event, std::mem::take(&mut guard.reasons)))
                } else {
                    None
                }
            };

            if let Some((event, reasons)) = finished {
                if reasons.is_empty() {
                    event.trigger();
                } else {
                    event.poison(reasons.join("; "));
                }
            }
        }));
    }

    merged
}
