//! Schema reconciliation.
//!
//! Upgrades are planned by diffing what the database holds against the
//! declared schema. Planning is pure; applying the plan is the only step that
//! touches the engine.

use crate::engine::UpgradeTransaction;
use crate::error::Result;
use crate::schema::declaration::{CollectionOptions, IndexSpec, Schema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Collections currently in the database, with their index names.
pub type ExistingCatalog = BTreeMap<String, BTreeSet<String>>;

/// One action of an upgrade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStep {
    CreateCollection {
        name: String,
        options: CollectionOptions,
    },
    CreateIndex {
        collection: String,
        index: IndexSpec,
    },
    DeleteIndex {
        collection: String,
        index: String,
    },
}

/// Diff the existing catalog against the declared schema.
///
/// Missing collections are created together with all their indexes. For
/// collections that already exist, undeclared indexes are deleted before
/// missing ones are created. Collections absent from the schema are left
/// alone.
pub fn plan(existing: &ExistingCatalog, schema: &Schema) -> Vec<MigrationStep> {
    let mut steps = Vec::new();

    for collection in schema.collections() {
        match existing.get(&collection.name) {
            None => {
                steps.push(MigrationStep::CreateCollection {
                    name: collection.name.clone(),
                    options: collection.options.clone(),
                });
                steps.extend(collection.indexes.iter().map(|index| MigrationStep::CreateIndex {
                    collection: collection.name.clone(),
                    index: index.clone(),
                }));
            }
            Some(index_names) => {
                let declared: BTreeSet<&str> = collection.index_names().collect();

                steps.extend(
                    index_names
                        .iter()
                        .filter(|name| !declared.contains(name.as_str()))
                        .map(|name| MigrationStep::DeleteIndex {
                            collection: collection.name.clone(),
                            index: name.clone(),
                        }),
                );

                steps.extend(
                    collection
                        .indexes
                        .iter()
                        .filter(|index| !index_names.contains(&index.name))
                        .map(|index| MigrationStep::CreateIndex {
                            collection: collection.name.clone(),
                            index: index.clone(),
                        }),
                );
            }
        }
    }

    steps
}

/// Read the catalog an upgrade starts from.
pub fn inspect(tx: &dyn UpgradeTransaction) -> Result<ExistingCatalog> {
    let mut catalog = ExistingCatalog::new();
    for name in tx.collection_names() {
        let indexes = tx.index_names(&name)?.into_iter().collect();
        catalog.insert(name, indexes);
    }
    Ok(catalog)
}

/// Execute planned steps in order.
pub fn apply(tx: &mut dyn UpgradeTransaction, steps: &[MigrationStep]) -> Result<()> {
    for step in steps {
        match step {
            MigrationStep::CreateCollection { name, options } => {
                tx.create_collection(name, options)?
            }
            MigrationStep::CreateIndex { collection, index } => {
                tx.create_index(collection, index)?
            }
            MigrationStep::DeleteIndex { collection, index } => {
                tx.delete_index(collection, index)?
            }
        }
    }
    Ok(())
}

/// Plan against the live catalog and apply the result.
pub fn reconcile(tx: &mut dyn UpgradeTransaction, schema: &Schema) -> Result<Vec<MigrationStep>> {
    let existing = inspect(tx)?;
    let steps = plan(&existing, schema);
    apply(tx, &steps)?;
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::declaration::CollectionSpec;
    use proptest::prelude::*;

    fn catalog(entries: &[(&str, &[&str])]) -> ExistingCatalog {
        entries
            .iter()
            .map(|(name, indexes)| {
                (
                    name.to_string(),
                    indexes.iter().map(|i| i.to_string()).collect(),
                )
            })
            .collect()
    }

    fn replay(existing: &mut ExistingCatalog, steps: &[MigrationStep]) {
        for step in steps {
            match step {
                MigrationStep::CreateCollection { name, .. } => {
                    existing.insert(name.clone(), BTreeSet::new());
                }
                MigrationStep::CreateIndex { collection, index } => {
                    existing
                        .get_mut(collection)
                        .unwrap()
                        .insert(index.name.clone());
                }
                MigrationStep::DeleteIndex { collection, index } => {
                    existing.get_mut(collection).unwrap().remove(index);
                }
            }
        }
    }

    #[test]
    fn test_new_collection_gets_all_indexes() {
        let schema = Schema::new(vec![CollectionSpec::new("subtitles")
            .auto_increment()
            .index(IndexSpec::new("language"))
            .index(IndexSpec::new("src"))])
        .unwrap();

        let steps = plan(&ExistingCatalog::new(), &schema);
        assert_eq!(steps.len(), 3);
        assert!(matches!(
            &steps[0],
            MigrationStep::CreateCollection { name, options } if name == "subtitles" && options.auto_increment
        ));
        assert!(matches!(
            &steps[2],
            MigrationStep::CreateIndex { index, .. } if index.name == "src"
        ));
    }

    #[test]
    fn test_existing_collection_deletes_before_creating() {
        let schema = Schema::new(vec![CollectionSpec::new("subtitles")
            .index(IndexSpec::new("language"))
            .index(IndexSpec::new("format"))])
        .unwrap();
        let existing = catalog(&[("subtitles", &["language", "type"])]);

        let steps = plan(&existing, &schema);
        assert_eq!(
            steps,
            vec![
                MigrationStep::DeleteIndex {
                    collection: "subtitles".into(),
                    index: "type".into(),
                },
                MigrationStep::CreateIndex {
                    collection: "subtitles".into(),
                    index: IndexSpec::new("format"),
                },
            ]
        );
    }

    #[test]
    fn test_undeclared_collections_untouched() {
        let schema = Schema::new(vec![CollectionSpec::new("a")]).unwrap();
        let existing = catalog(&[("a", &[]), ("legacy", &["x"])]);
        assert!(plan(&existing, &schema).is_empty());
    }

    fn arb_names() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set("[a-d]", 0..4)
    }

    proptest! {
        #[test]
        fn prop_plan_converges(
            declared in prop::collection::btree_map("[a-c]", arb_names(), 0..3),
            existing in prop::collection::btree_map("[a-e]", arb_names(), 0..4),
        ) {
            let schema = Schema::new(
                declared
                    .iter()
                    .map(|(name, indexes)| {
                        indexes
                            .iter()
                            .fold(CollectionSpec::new(name.clone()), |c, i| c.index(IndexSpec::new(i.clone())))
                    })
                    .collect(),
            )
            .unwrap();

            let mut after = existing.clone();
            replay(&mut after, &plan(&existing, &schema));

            for (name, indexes) in &declared {
                prop_assert_eq!(after.get(name), Some(indexes));
            }
            for (name, indexes) in &existing {
                if !declared.contains_key(name) {
                    prop_assert_eq!(after.get(name), Some(indexes));
                }
            }
            prop_assert!(plan(&after, &schema).is_empty());
        }
    }
}
