use std::collections::HashMap;

use crate::model::NamespaceScope;

pub type Row = Vec<String>;

/// Freshly built rows keyed by resource FQN, before classification.
pub type Snapshot = HashMap<String, Row>;

/// Classified rows keyed by resource FQN.
pub type RowEvents = HashMap<String, RowEvent>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RowAction {
    New,
    Added,
    Modified,
    Unchanged,
}

/// One display row plus its classification. `deltas[i]` holds the previous
/// value of `fields[i]` when that cell changed, and is empty otherwise.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RowEvent {
    pub action: RowAction,
    pub fields: Row,
    pub deltas: Row,
}

impl RowEvent {
    fn unchanged(action: RowAction, fields: Row) -> Self {
        let deltas = blank_row(fields.len());
        Self {
            action,
            fields,
            deltas,
        }
    }

    pub fn changed_at(&self, index: usize) -> bool {
        self.deltas
            .get(index)
            .is_some_and(|delta| !delta.is_empty())
    }

    pub fn has_deltas(&self) -> bool {
        self.deltas.iter().any(|delta| !delta.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableData {
    pub header: Row,
    pub rows: RowEvents,
    pub namespace: NamespaceScope,
}

impl TableData {
    pub fn new(header: Row, namespace: NamespaceScope) -> Self {
        Self {
            header,
            rows: RowEvents::new(),
            namespace,
        }
    }

    /// Row keys in display order.
    pub fn sorted_keys(&self) -> Vec<String> {
        let mut keys = self.rows.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn count(&self, action: RowAction) -> usize {
        self.rows
            .values()
            .filter(|event| event.action == action)
            .count()
    }
}

/// Diffs successive snapshots of one view against its private cache.
///
/// The cache is replaced by a fresh map on every pass, so keys that vanish
/// are forgotten and come back as fresh rows if they reappear.
#[derive(Debug, Clone)]
pub struct Reconciler {
    header: Row,
    namespace: NamespaceScope,
    cache: HashMap<String, Row>,
}

impl Reconciler {
    pub fn new(header: Row, namespace: NamespaceScope) -> Self {
        Self {
            header,
            namespace,
            cache: HashMap::new(),
        }
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }

    pub fn reconcile(&mut self, snapshot: Snapshot) -> TableData {
        let width = self.header.len();
        let seeding = self.cache.is_empty();
        let mut table = TableData::new(self.header.clone(), self.namespace.clone());
        table.rows.reserve(snapshot.len());
        let mut next = HashMap::with_capacity(snapshot.len());

        for (key, fields) in snapshot {
            let fields = fit(fields, width);
            let event = match self.cache.get(&key) {
                None if seeding => RowEvent::unchanged(RowAction::New, fields.clone()),
                None => RowEvent::unchanged(RowAction::Added, fields.clone()),
                Some(previous) if *previous == fields => {
                    RowEvent::unchanged(RowAction::Unchanged, fields.clone())
                }
                Some(previous) => RowEvent {
                    action: RowAction::Modified,
                    deltas: deltas(previous, &fields),
                    fields: fields.clone(),
                },
            };
            next.insert(key.clone(), fields);
            table.rows.insert(key, event);
        }
        self.cache = next;

        table
    }
}

fn blank_row(width: usize) -> Row {
    vec![String::new(); width]
}

fn fit(mut fields: Row, width: usize) -> Row {
    fields.resize(width, String::new());
    fields
}

fn deltas(previous: &[String], current: &[String]) -> Row {
    current
        .iter()
        .enumerate()
        .map(|(index, field)| match previous.get(index) {
            Some(old) if old != field => old.clone(),
            Some(_) => String::new(),
            None => "-".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Reconciler, Row, RowAction, Snapshot};
    use crate::model::NamespaceScope;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn header() -> Row {
        vec!["NAME".to_string(), "STATUS".to_string(), "AGE".to_string()]
    }

    fn row(values: &[&str]) -> Row {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn snapshot(rows: &[(&str, &[&str])]) -> Snapshot {
        rows.iter()
            .map(|(key, values)| (key.to_string(), row(values)))
            .collect()
    }

    #[test]
    fn first_pass_seeds_everything_as_new() {
        let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
        let table = reconciler.reconcile(snapshot(&[
            ("ns1/p1", &["p1", "Running", "1m"]),
            ("ns1/p2", &["p2", "Pending", "2m"]),
        ]));

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.count(RowAction::New), 2);
        assert!(table.rows.values().all(|event| !event.has_deltas()));
        assert_eq!(reconciler.cached(), 2);
    }

    #[test]
    fn second_pass_classifies_against_cache() {
        let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
        reconciler.reconcile(snapshot(&[
            ("ns1/p1", &["p1", "Running", "1m"]),
            ("ns1/p2", &["p2", "Pending", "2m"]),
            ("ns1/p3", &["p3", "Running", "3m"]),
        ]));

        let table = reconciler.reconcile(snapshot(&[
            ("ns1/p1", &["p1", "Running", "1m"]),
            ("ns1/p2", &["p2", "Running", "2m"]),
            ("ns1/p4", &["p4", "Pending", "1s"]),
        ]));

        assert_eq!(table.rows["ns1/p1"].action, RowAction::Unchanged);
        let modified = &table.rows["ns1/p2"];
        assert_eq!(modified.action, RowAction::Modified);
        assert_eq!(modified.deltas, row(&["", "Pending", ""]));
        assert!(modified.changed_at(1));
        assert!(!modified.changed_at(0));
        assert_eq!(table.rows["ns1/p4"].action, RowAction::Added);
        assert!(!table.rows.contains_key("ns1/p3"));
        assert_eq!(reconciler.cached(), 3);
    }

    #[test]
    fn dropped_keys_return_as_fresh() {
        let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
        reconciler.reconcile(snapshot(&[
            ("a", &["a", "Running", "1m"]),
            ("b", &["b", "Running", "1m"]),
        ]));
        reconciler.reconcile(snapshot(&[("a", &["a", "Running", "1m"])]));

        let table = reconciler.reconcile(snapshot(&[
            ("a", &["a", "Running", "1m"]),
            ("b", &["b", "Failed", "1m"]),
        ]));
        let back = &table.rows["b"];
        assert_eq!(back.action, RowAction::Added);
        assert!(!back.has_deltas());
    }

    #[test]
    fn rows_are_fitted_to_header() {
        let mut reconciler = Reconciler::new(header(), NamespaceScope::Named("ns1".to_string()));
        let table = reconciler.reconcile(snapshot(&[
            ("short", &["short"]),
            ("long", &["long", "Running", "1m", "extra"]),
        ]));

        for event in table.rows.values() {
            assert_eq!(event.fields.len(), 3);
            assert_eq!(event.deltas.len(), 3);
        }
        assert_eq!(table.namespace, NamespaceScope::Named("ns1".to_string()));
    }

    #[test]
    fn reset_reseeds() {
        let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
        reconciler.reconcile(snapshot(&[("a", &["a", "Running", "1m"])]));
        reconciler.reset();
        let table = reconciler.reconcile(snapshot(&[("b", &["b", "Running", "1m"])]));
        assert_eq!(table.rows["b"].action, RowAction::New);
    }

    fn snapshot_strategy() -> impl Strategy<Value = Snapshot> {
        prop::collection::hash_map(
            "[a-e]{1,2}",
            prop::collection::vec("[xyz]{0,2}", 3),
            1..12,
        )
    }

    proptest! {
        #[test]
        fn classification_matches_set_relations(s1 in snapshot_strategy(), s2 in snapshot_strategy()) {
            let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
            let seeded = reconciler.reconcile(s1.clone());
            prop_assert!(seeded.rows.values().all(|event| event.action == RowAction::New));

            let table = reconciler.reconcile(s2.clone());
            prop_assert_eq!(table.rows.len(), s2.len());
            for (key, fields) in &s2 {
                let event = &table.rows[key];
                prop_assert_eq!(event.deltas.len(), fields.len());
                match s1.get(key) {
                    None => {
                        prop_assert_eq!(event.action, RowAction::Added);
                        prop_assert!(!event.has_deltas());
                    }
                    Some(old) if old == fields => {
                        prop_assert_eq!(event.action, RowAction::Unchanged);
                        prop_assert!(!event.has_deltas());
                    }
                    Some(old) => {
                        prop_assert_eq!(event.action, RowAction::Modified);
                        for index in 0..fields.len() {
                            if old[index] == fields[index] {
                                prop_assert!(event.deltas[index].is_empty());
                            } else {
                                prop_assert_eq!(&event.deltas[index], &old[index]);
                            }
                        }
                    }
                }
            }
        }

        #[test]
        fn reconciling_twice_is_unchanged(s in snapshot_strategy()) {
            let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
            reconciler.reconcile(s.clone());
            let table = reconciler.reconcile(s);
            prop_assert!(table.rows.values().all(|event| event.action == RowAction::Unchanged));
            prop_assert!(table.rows.values().all(|event| !event.has_deltas()));
        }
    }

    #[test]
    fn deltas_only_mark_changed_cells() {
        let previous: HashMap<String, Row> =
            HashMap::from([("a".to_string(), row(&["a", "1", "x"]))]);
        let mut reconciler = Reconciler::new(header(), NamespaceScope::All);
        reconciler.reconcile(previous);
        let table = reconciler.reconcile(snapshot(&[("a", &["a", "2", "y"])]));
        assert_eq!(table.rows["a"].deltas, row(&["", "1", "x"]));
    }
}
