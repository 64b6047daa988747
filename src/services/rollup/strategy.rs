//! Batch computation of inherited dates on the legacy records.
//!
//! One strategy instance handles one date field. A node with a fixed date
//! keeps it verbatim; otherwise the effective date aggregates the
//! immediate children's effective dates — minimum for start, maximum for
//! due — skipping children with no date. No contributing children clears
//! the date. Rows whose date and sourcing child are both unchanged are not
//! written.

use crate::error::Result;
use crate::model::DateField;
use crate::storage::sqlite;
use chrono::NaiveDate;
use rusqlite::Connection;

/// Recomputes one date field for a batch of epics.
#[derive(Debug, Clone, Copy)]
pub struct InheritedDateStrategy {
    field: DateField,
}

impl InheritedDateStrategy {
    #[must_use]
    pub const fn start_date() -> Self {
        Self {
            field: DateField::Start,
        }
    }

    #[must_use]
    pub const fn due_date() -> Self {
        Self {
            field: DateField::Due,
        }
    }

    #[must_use]
    pub const fn field(&self) -> DateField {
        self.field
    }

    /// Recompute the field for every epic in the batch, returning the ids
    /// whose stored value actually changed.
    ///
    /// Ids that no longer resolve to an epic are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a query or update fails; the caller's
    /// transaction rolls the whole batch back.
    pub fn apply(&self, tx: &Connection, epic_ids: &[String]) -> Result<Vec<String>> {
        let mut changed = Vec::new();

        for epic_id in epic_ids {
            let Some(epic) = sqlite::epic_by_id(tx, epic_id)? else {
                tracing::debug!(epic_id, "skipping vanished epic in rollup batch");
                continue;
            };

            let current = epic.effective_date(self.field);
            let (current_source, is_fixed, fixed) = match self.field {
                DateField::Start => (
                    epic.start_date_sourcing_child_id.clone(),
                    epic.start_date_is_fixed,
                    epic.start_date_fixed,
                ),
                DateField::Due => (
                    epic.due_date_sourcing_child_id.clone(),
                    epic.due_date_is_fixed,
                    epic.due_date_fixed,
                ),
            };

            let (next, next_source) = if is_fixed {
                (fixed, None)
            } else {
                let contributions = sqlite::child_date_contributions(tx, epic_id)?;
                self.aggregate(&contributions)
            };

            if next == current && next_source == current_source {
                continue;
            }

            sqlite::update_epic_dates(tx, epic_id, self.field, next, next_source.as_deref())?;
            tracing::debug!(epic_id, field = self.field.as_str(), "rolled up date changed");
            changed.push(epic_id.clone());
        }

        Ok(changed)
    }

    /// Pick the winning child date: min for start, max for due, dateless
    /// children absent from the aggregation.
    fn aggregate(
        &self,
        contributions: &[(String, Option<NaiveDate>, Option<NaiveDate>)],
    ) -> (Option<NaiveDate>, Option<String>) {
        let mut winner: Option<(NaiveDate, &str)> = None;
        for (child_id, start, due) in contributions {
            let candidate = match self.field {
                DateField::Start => start,
                DateField::Due => due,
            };
            let Some(candidate) = candidate else {
                continue;
            };
            let better = match (self.field, winner) {
                (_, None) => true,
                (DateField::Start, Some((best, _))) => *candidate < best,
                (DateField::Due, Some((best, _))) => *candidate > best,
            };
            if better {
                winner = Some((*candidate, child_id));
            }
        }
        match winner {
            Some((date, child_id)) => (Some(date), Some(child_id.to_string())),
            None => (None, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Epic, Issue, NodeState};
    use crate::storage::SqliteStorage;
    use chrono::{TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn epic(id: &str, parent: Option<&str>) -> Epic {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Epic {
            id: id.to_string(),
            group_id: "grp-1".to_string(),
            title: format!("Epic {id}"),
            parent_id: parent.map(ToString::to_string),
            relative_position: 0,
            state: NodeState::Opened,
            created_at: now,
            updated_at: now,
            closed_at: None,
            start_date: None,
            due_date: None,
            start_date_is_fixed: false,
            start_date_fixed: None,
            due_date_is_fixed: false,
            due_date_fixed: None,
            start_date_sourcing_child_id: None,
            due_date_sourcing_child_id: None,
            work_item_id: None,
        }
    }

    fn issue(id: &str, start: Option<NaiveDate>, due: Option<NaiveDate>) -> Issue {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            state: NodeState::Opened,
            start_date: start,
            due_date: due,
            work_item_id: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    fn apply(storage: &mut SqliteStorage, strategy: InheritedDateStrategy, ids: &[&str]) -> Vec<String> {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        storage
            .mutate("rollup", "tester", |tx, _ctx| strategy.apply(tx, &ids))
            .unwrap()
    }

    #[test]
    fn inherits_the_minimum_child_start_date_ignoring_null() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.create_epic(&epic("ep-a", None), "tester").unwrap();
        let mut child1 = epic("ep-c1", Some("ep-a"));
        child1.start_date = Some(date(2024, 1, 10));
        storage.create_epic(&child1, "tester").unwrap();
        let mut child2 = epic("ep-c2", Some("ep-a"));
        child2.start_date = Some(date(2024, 1, 5));
        storage.create_epic(&child2, "tester").unwrap();
        storage.create_epic(&epic("ep-c3", Some("ep-a")), "tester").unwrap();

        let changed = apply(&mut storage, InheritedDateStrategy::start_date(), &["ep-a"]);
        assert_eq!(changed, vec!["ep-a".to_string()]);

        let parent = storage.get_epic("ep-a").unwrap().unwrap();
        assert_eq!(parent.start_date, Some(date(2024, 1, 5)));
        assert_eq!(parent.start_date_sourcing_child_id.as_deref(), Some("ep-c2"));
    }

    #[test]
    fn fixed_date_overrides_children() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut parent = epic("ep-n", None);
        parent.start_date_is_fixed = true;
        parent.start_date_fixed = Some(date(2024, 2, 1));
        storage.create_epic(&parent, "tester").unwrap();
        let mut child1 = epic("ep-c1", Some("ep-n"));
        child1.start_date = Some(date(2024, 1, 1));
        storage.create_epic(&child1, "tester").unwrap();
        let mut child2 = epic("ep-c2", Some("ep-n"));
        child2.start_date = Some(date(2024, 3, 1));
        storage.create_epic(&child2, "tester").unwrap();

        apply(&mut storage, InheritedDateStrategy::start_date(), &["ep-n"]);

        let parent = storage.get_epic("ep-n").unwrap().unwrap();
        assert_eq!(parent.start_date, Some(date(2024, 2, 1)));
        assert_eq!(parent.start_date_sourcing_child_id, None);
    }

    #[test]
    fn due_date_takes_the_maximum_across_epics_and_issues() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.create_epic(&epic("ep-a", None), "tester").unwrap();
        let mut child = epic("ep-c1", Some("ep-a"));
        child.due_date = Some(date(2024, 6, 1));
        storage.create_epic(&child, "tester").unwrap();
        storage
            .create_issue(&issue("is-1", None, Some(date(2024, 7, 15))), "tester")
            .unwrap();
        storage
            .create_issue_link("el-1", "is-1", "ep-a", "tester")
            .unwrap();

        apply(&mut storage, InheritedDateStrategy::due_date(), &["ep-a"]);

        let parent = storage.get_epic("ep-a").unwrap().unwrap();
        assert_eq!(parent.due_date, Some(date(2024, 7, 15)));
        assert_eq!(parent.due_date_sourcing_child_id.as_deref(), Some("is-1"));
    }

    #[test]
    fn no_contributing_children_clears_the_date() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut parent = epic("ep-a", None);
        parent.start_date = Some(date(2024, 1, 1));
        parent.start_date_sourcing_child_id = Some("ep-old".to_string());
        storage.create_epic(&parent, "tester").unwrap();
        storage.create_epic(&epic("ep-c1", Some("ep-a")), "tester").unwrap();

        let changed = apply(&mut storage, InheritedDateStrategy::start_date(), &["ep-a"]);
        assert_eq!(changed, vec!["ep-a".to_string()]);

        let parent = storage.get_epic("ep-a").unwrap().unwrap();
        assert_eq!(parent.start_date, None);
        assert_eq!(parent.start_date_sourcing_child_id, None);
    }

    #[test]
    fn unchanged_rows_are_skipped() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.create_epic(&epic("ep-a", None), "tester").unwrap();
        let mut child = epic("ep-c1", Some("ep-a"));
        child.start_date = Some(date(2024, 1, 5));
        storage.create_epic(&child, "tester").unwrap();

        let strategy = InheritedDateStrategy::start_date();
        let first = apply(&mut storage, strategy, &["ep-a"]);
        assert_eq!(first.len(), 1);
        let second = apply(&mut storage, strategy, &["ep-a"]);
        assert!(second.is_empty(), "second run must not rewrite anything");
    }

    #[test]
    fn vanished_epics_are_skipped() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let changed = apply(&mut storage, InheritedDateStrategy::start_date(), &["ep-ghost"]);
        assert!(changed.is_empty());
    }
}
