use parking_lot::RwLock;
use std::collections::VecDeque;

use crate::engine::operations::OrderListSummary;

/// Per-portfolio continuation state of the order poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortfolioCursor {
    /// Oldest order still incomplete on the last poll, 0 when none was.
    pub oldest_incomplete: i64,
    /// Page size for the next poll.
    pub count: u32,
    /// Inactive portfolios are skipped until new activity is registered.
    pub active: bool,
    /// Bumped by every registered activity.
    pub activity: u64,
}

impl PortfolioCursor {
    fn fresh(count: u32) -> Self {
        Self {
            oldest_incomplete: 0,
            count,
            active: true,
            activity: 0,
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: String,
    cursor: PortfolioCursor,
}

#[derive(Debug, Default)]
struct BookState {
    entries: Vec<Entry>,
    /// Portfolios with fresh activity, polled ahead of the rotation.
    priority: VecDeque<String>,
}

impl BookState {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

/// Known portfolios in discovery order. Append-only while the client lives.
#[derive(Debug)]
pub struct PortfolioBook {
    default_count: u32,
    state: RwLock<BookState>,
}

impl PortfolioBook {
    pub fn new(default_count: u32) -> Self {
        Self {
            default_count: default_count.max(1),
            state: RwLock::new(BookState::default()),
        }
    }

    /// Returns true if `id` was not known yet.
    pub fn add(&self, id: &str) -> bool {
        let mut state = self.state.write();
        if state.position(id).is_some() {
            return false;
        }
        state.entries.push(Entry {
            id: id.to_string(),
            cursor: PortfolioCursor::fresh(self.default_count),
        });
        true
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.read().entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self, id: &str) -> Option<PortfolioCursor> {
        let state = self.state.read();
        state.position(id).map(|i| state.entries[i].cursor)
    }

    /// Folds a finished order poll into the portfolio's cursor.
    ///
    /// `activity` is the cursor's activity count when the poll was issued.
    /// Activity registered since then keeps the portfolio in rotation, as
    /// the poll's pages predate it.
    pub fn apply_summary(&self, id: &str, activity: u64, summary: OrderListSummary) {
        let mut state = self.state.write();
        if let Some(i) = state.position(id) {
            let cursor = &mut state.entries[i].cursor;
            let fresh_activity = cursor.activity != activity;
            cursor.oldest_incomplete = summary.oldest_incomplete;
            cursor.count = summary.next_count();
            cursor.active = summary.oldest_incomplete > 0 || fresh_activity;
        }
    }

    pub fn deactivate(&self, id: &str) {
        let mut state = self.state.write();
        if let Some(i) = state.position(id) {
            state.entries[i].cursor.active = false;
        }
    }

    /// Puts `id` back into rotation, ahead of everything else.
    ///
    /// The cursor keeps its oldest-incomplete marker and page size; the poll
    /// it triggers widens them again if needed.
    pub fn register_activity(&self, id: &str) {
        let mut state = self.state.write();
        let index = match state.position(id) {
            Some(i) => i,
            None => {
                state.entries.push(Entry {
                    id: id.to_string(),
                    cursor: PortfolioCursor::fresh(self.default_count),
                });
                state.entries.len() - 1
            }
        };
        let cursor = &mut state.entries[index].cursor;
        cursor.active = true;
        cursor.activity += 1;
        cursor.count = cursor.count.max(self.default_count);

        state.priority.retain(|p| p != id);
        state.priority.push_front(id.to_string());
    }

    /// Next active portfolio after `current`, wrapping around.
    ///
    /// Portfolios with registered activity come first. `None` when nothing
    /// is active.
    pub fn next_active_after(&self, current: Option<&str>) -> Option<(String, PortfolioCursor)> {
        let mut state = self.state.write();

        while let Some(id) = state.priority.pop_front() {
            if let Some(i) = state.position(&id) {
                if state.entries[i].cursor.active {
                    return Some((id, state.entries[i].cursor));
                }
            }
        }

        let len = state.entries.len();
        if len == 0 {
            return None;
        }
        let start = current
            .and_then(|c| state.position(c))
            .map(|i| i + 1)
            .unwrap_or(0);

        (0..len)
            .map(|offset| &state.entries[(start + offset) % len])
            .find(|e| e.cursor.active)
            .map(|e| (e.id.clone(), e.cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(ids: &[&str]) -> PortfolioBook {
        let book = PortfolioBook::new(25);
        for id in ids {
            book.add(id);
        }
        book
    }

    fn next(book: &PortfolioBook, current: Option<&str>) -> Option<String> {
        book.next_active_after(current).map(|(id, _)| id)
    }

    #[test]
    fn add_is_append_only_and_deduplicated() {
        let book = book(&["P1", "P2"]);
        assert!(!book.add("P1"));
        assert!(book.add("P3"));
        assert_eq!(book.ids(), vec!["P1", "P2", "P3"]);
        assert_eq!(book.cursor("P3").unwrap().count, 25);
    }

    #[test]
    fn rotation_wraps_around() {
        let book = book(&["P1", "P2", "P3"]);
        assert_eq!(next(&book, None).as_deref(), Some("P1"));
        assert_eq!(next(&book, Some("P1")).as_deref(), Some("P2"));
        assert_eq!(next(&book, Some("P3")).as_deref(), Some("P1"));
    }

    #[test]
    fn completed_portfolio_is_skipped() {
        let book = book(&["P1", "P2", "P3"]);
        let polled = next(&book, None).unwrap();
        let polled = next(&book, Some(&polled)).unwrap();
        assert_eq!(polled, "P2");

        book.apply_summary(
            "P2",
            0,
            OrderListSummary {
                oldest_incomplete: 0,
                orders_since_oldest: 0,
            },
        );
        assert_eq!(next(&book, Some("P2")).as_deref(), Some("P3"));
        assert_eq!(next(&book, Some("P1")).as_deref(), Some("P3"));
    }

    #[test]
    fn nothing_active_yields_none() {
        let book = book(&["P1", "P2"]);
        book.deactivate("P1");
        book.deactivate("P2");
        assert_eq!(next(&book, Some("P1")), None);
        assert_eq!(next(&PortfolioBook::new(25), None), None);
    }

    #[test]
    fn activity_jumps_the_queue() {
        let book = book(&["P1", "P2", "P3"]);
        book.deactivate("P3");
        book.register_activity("P3");
        assert_eq!(next(&book, Some("P1")).as_deref(), Some("P3"));
        // Priority is consumed once, rotation resumes after it.
        assert_eq!(next(&book, Some("P3")).as_deref(), Some("P1"));
    }

    #[test]
    fn summary_sets_cursor() {
        let book = book(&["P1"]);
        book.apply_summary(
            "P1",
            0,
            OrderListSummary {
                oldest_incomplete: 1234,
                orders_since_oldest: 12,
            },
        );
        assert_eq!(
            book.cursor("P1"),
            Some(PortfolioCursor {
                oldest_incomplete: 1234,
                count: 17,
                active: true,
                activity: 0,
            })
        );
    }

    #[test]
    fn activity_during_a_poll_keeps_the_portfolio_active() {
        let book = book(&["P1", "P2"]);
        let (_, cursor) = book.next_active_after(None).unwrap();

        book.register_activity("P1");
        book.apply_summary(
            "P1",
            cursor.activity,
            OrderListSummary {
                oldest_incomplete: 0,
                orders_since_oldest: 0,
            },
        );

        let after = book.cursor("P1").unwrap();
        assert!(after.active);
        assert_eq!(after.oldest_incomplete, 0);
        assert_eq!(next(&book, Some("P2")).as_deref(), Some("P1"));
    }
}
