//! Unread reconciliation.
//!
//! Chat lists are never patched in place. Every refresh pulls the aggregate
//! unread summary from the store, rebuilds the snapshot, reorders it from
//! scratch and pushes it to the user's chat-list channel.

use crate::clock::now_millis;
use crate::router::{DeliveryReport, EventRouter};
use crate::store::{ChatStore, StoreError};
use futures_util::future::join_all;
use parley_protocol::{ChatSummary, Event, UnreadSnapshot, UserId};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Chat list order: latest activity first (empty chats last), then chats
/// with unread messages, then display name ignoring case. The chat key breaks
/// any remaining tie so the order is total.
fn compare_chats(a: &ChatSummary, b: &ChatSummary) -> Ordering {
    b.last_activity_at
        .cmp(&a.last_activity_at)
        .then_with(|| (b.unread_count > 0).cmp(&(a.unread_count > 0)))
        .then_with(|| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        })
        .then_with(|| a.chat.cmp(&b.chat))
}

/// Sort chats into display order. Deterministic for any input order.
pub fn order_chats(chats: &mut [ChatSummary]) {
    chats.sort_by(compare_chats);
}

/// Build an ordered snapshot from a raw store summary.
#[must_use]
pub fn build_snapshot(user_id: UserId, mut chats: Vec<ChatSummary>, generated_at: u64) -> UnreadSnapshot {
    order_chats(&mut chats);
    let total_unread = chats.iter().map(|c| u64::from(c.unread_count)).sum();
    UnreadSnapshot {
        user_id,
        chats,
        total_unread,
        generated_at,
    }
}

/// Recomputes and republishes chat lists.
pub struct UnreadReconciler {
    store: Arc<dyn ChatStore>,
    router: Arc<EventRouter>,
}

impl UnreadReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, router: Arc<EventRouter>) -> Self {
        Self { store, router }
    }

    /// Compute a user's snapshot without publishing it.
    ///
    /// # Errors
    ///
    /// Returns the store error if the unread summary cannot be read.
    pub async fn snapshot(&self, user_id: &UserId) -> Result<UnreadSnapshot, StoreError> {
        let chats = self.store.unread_summary(user_id).await?;
        Ok(build_snapshot(user_id.clone(), chats, now_millis()))
    }

    /// Compute one user's snapshot and push it to their chat-list channel.
    ///
    /// # Errors
    ///
    /// Returns the store error if the unread summary cannot be read; nothing
    /// is routed in that case.
    pub async fn refresh_user(
        &self,
        user_id: &UserId,
    ) -> Result<(UnreadSnapshot, DeliveryReport), StoreError> {
        let snapshot = self.snapshot(user_id).await?;
        let report = self
            .router
            .route(Event::ChatListRefreshed {
                user_id: user_id.clone(),
                snapshot: snapshot.clone(),
            })
            .await;
        Ok((snapshot, report))
    }

    /// Refresh every given user. Duplicates are collapsed.
    ///
    /// Summaries are read concurrently, one aggregate read per user. A user
    /// whose read fails is skipped and logged; the rest are still published.
    pub async fn refresh(&self, user_ids: &[UserId]) -> DeliveryReport {
        let users: BTreeSet<&UserId> = user_ids.iter().collect();
        let snapshots = join_all(users.iter().map(|user_id| self.snapshot(user_id))).await;

        let mut report = DeliveryReport::default();
        for (user_id, result) in users.into_iter().zip(snapshots) {
            match result {
                Ok(snapshot) => {
                    report += self
                        .router
                        .route(Event::ChatListRefreshed {
                            user_id: user_id.clone(),
                            snapshot,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Unread summary failed, chat list not refreshed");
                }
            }
        }

        debug!(users = user_ids.len(), delivered = report.delivered, "Refreshed chat lists");
        report
    }
}
