//! Catalog-based schema differ.
//!
//! Compares two [`CatalogSnapshot`]s and emits the statements that turn the
//! current one into the desired one. Creations run in dependency order
//! (schemas, extensions, types, sequences, functions, tables, columns,
//! constraints, indexes, foreign keys, views, triggers), followed by removals
//! in reverse dependency order. Objects that changed are dropped ahead of the
//! creations and recreated in their regular phase.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::connection::{ConnectionInfo, quote_identifier};
use crate::diff::{
    DiffOptions, Hazard, HazardType, LONG_RUNNING_TIMEOUT, Plan, SchemaDiffer, Statement,
};
use crate::dump::PgTools;
use crate::error::{MigrateResult, MigrationError};
use crate::introspect::{
    CatalogSnapshot, Column, ConstraintKind, QualifiedName, Sequence, Table,
};
use crate::shadow::ScratchDatabaseFactory;

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Differ working on catalog snapshots of both databases.
#[derive(Debug, Clone, Default)]
pub struct CatalogDiffer {
    options: DiffOptions,
    tools: PgTools,
}

impl CatalogDiffer {
    /// Create a differ with the given options.
    pub fn new(options: DiffOptions) -> Self {
        Self {
            options,
            tools: PgTools::new(),
        }
    }

    /// Use specific PostgreSQL client tools for plan validation.
    pub fn with_tools(mut self, tools: PgTools) -> Self {
        self.tools = tools;
        self
    }

    /// Active options.
    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    async fn snapshot(&self, info: &ConnectionInfo) -> MigrateResult<CatalogSnapshot> {
        let client = info
            .connect()
            .await
            .map_err(|e| MigrationError::diff(e.to_string()))?;
        CatalogSnapshot::load(&client, &self.options.schemas)
            .await
            .map_err(|e| MigrationError::diff(format!("introspecting {}: {}", info.database, e)))
    }

    /// Replay the plan on a copy of `current` and check it converges.
    async fn validate(
        &self,
        current: &ConnectionInfo,
        desired: &CatalogSnapshot,
        scratch: &ScratchDatabaseFactory,
        plan: &Plan,
    ) -> MigrateResult<()> {
        let copy = scratch.create().await?;
        let result = self.validate_on(current, &copy, desired, plan).await;
        if let Err(e) = scratch.drop_database(&copy).await {
            debug!(error = %e, "Failed to drop scratch database");
        }
        result
    }

    async fn validate_on(
        &self,
        current: &ConnectionInfo,
        copy: &ConnectionInfo,
        desired: &CatalogSnapshot,
        plan: &Plan,
    ) -> MigrateResult<()> {
        let dump = self.tools.dump_schema(current, &[]).await?;
        self.tools
            .psql_script(copy, &dump)
            .await
            .map_err(|e| MigrationError::diff(format!("restoring current schema: {}", e)))?;

        let client = copy
            .connect()
            .await
            .map_err(|e| MigrationError::diff(e.to_string()))?;
        client
            .batch_execute(&plan.render())
            .await
            .map_err(|e| MigrationError::diff(format!("plan does not apply: {}", e)))?;

        let replayed = self.snapshot(copy).await?;
        let residual = plan_changes(&replayed, desired, &self.options)?
            .without_bookkeeping(&self.options.bookkeeping_table);
        if !residual.is_empty() {
            return Err(MigrationError::diff(format!(
                "plan does not converge, {} statement(s) remain, first: {}",
                residual.len(),
                residual.statements[0].ddl
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SchemaDiffer for CatalogDiffer {
    async fn diff(
        &self,
        current: &ConnectionInfo,
        desired: &ConnectionInfo,
        scratch: &ScratchDatabaseFactory,
    ) -> MigrateResult<Plan> {
        let current_snapshot = self.snapshot(current).await?;
        let desired_snapshot = self.snapshot(desired).await?;

        let plan = plan_changes(&current_snapshot, &desired_snapshot, &self.options)?
            .without_bookkeeping(&self.options.bookkeeping_table);

        if self.options.validate_plan && !plan.is_empty() {
            self.validate(current, &desired_snapshot, scratch, &plan)
                .await?;
            info!(statements = plan.len(), "Validated plan");
        }
        Ok(plan)
    }

    fn name(&self) -> &'static str {
        "library"
    }
}

/// Compute the statements turning `current` into `desired`.
pub fn plan_changes(
    current: &CatalogSnapshot,
    desired: &CatalogSnapshot,
    options: &DiffOptions,
) -> MigrateResult<Plan> {
    let mut planner = Planner {
        current,
        desired,
        options,
        statements: Vec::new(),
    };
    planner.build()?;
    Ok(Plan::new(planner.statements))
}

struct Planner<'a> {
    current: &'a CatalogSnapshot,
    desired: &'a CatalogSnapshot,
    options: &'a DiffOptions,
    statements: Vec<Statement>,
}

impl Planner<'_> {
    fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    fn is_new_table(&self, name: &QualifiedName) -> bool {
        !self.current.tables.contains_key(name)
    }

    fn is_dropped_table(&self, name: &QualifiedName) -> bool {
        self.current.tables.contains_key(name) && !self.desired.tables.contains_key(name)
    }

    /// A view kept under the same name but dropped and created again. Its
    /// triggers and indexes go with it.
    fn is_recreated_view(&self, name: &QualifiedName) -> bool {
        match (self.current.views.get(name), self.desired.views.get(name)) {
            (Some(current), Some(desired)) => {
                current.definition != desired.definition
                    || current.materialized != desired.materialized
            }
            _ => false,
        }
    }

    fn build(&mut self) -> MigrateResult<()> {
        self.create_schemas();
        self.create_extensions();
        self.alter_enums()?;
        self.drop_changed_dependents();
        self.create_sequences();
        self.create_functions();
        self.create_tables();
        self.alter_columns()?;
        self.add_constraints(false);
        self.create_indexes(true);
        self.add_constraints(true);
        self.set_sequence_owners();
        self.create_views();
        self.create_indexes(false);
        self.create_triggers();
        self.drop_removed();
        Ok(())
    }

    fn create_schemas(&mut self) {
        for schema in self.desired.schemas.difference(&self.current.schemas) {
            self.push(Statement::new(format!(
                "CREATE SCHEMA {}",
                quote_identifier(schema)
            )));
        }
    }

    fn create_extensions(&mut self) {
        for (name, extension) in &self.desired.extensions {
            match self.current.extensions.get(name) {
                None => self.push(Statement::new(format!(
                    "CREATE EXTENSION IF NOT EXISTS {} WITH SCHEMA {} VERSION {}",
                    quote_identifier(name),
                    quote_identifier(&extension.schema),
                    quote_literal(&extension.version)
                ))),
                Some(existing) if existing.version != extension.version => {
                    self.push(Statement::new(format!(
                        "ALTER EXTENSION {} UPDATE TO {}",
                        quote_identifier(name),
                        quote_literal(&extension.version)
                    )))
                }
                Some(_) => {}
            }
        }
    }

    fn alter_enums(&mut self) -> MigrateResult<()> {
        for (name, labels) in &self.desired.enums {
            let Some(existing) = self.current.enums.get(name) else {
                let values: Vec<String> = labels.iter().map(|l| quote_literal(l)).collect();
                self.push(Statement::new(format!(
                    "CREATE TYPE {} AS ENUM ({})",
                    name,
                    values.join(", ")
                )));
                continue;
            };

            let kept: Vec<&String> = labels.iter().filter(|l| existing.contains(l)).collect();
            if kept.len() != existing.len() || kept.iter().zip(existing).any(|(a, b)| *a != b) {
                return Err(MigrationError::diff(format!(
                    "enum {} drops or reorders values, which PostgreSQL cannot alter in place",
                    name
                )));
            }

            for (position, label) in labels.iter().enumerate() {
                if existing.contains(label) {
                    continue;
                }
                // An enum without labels takes new values without a position.
                let placement = match (position.checked_sub(1), existing.first()) {
                    (Some(previous), _) => format!(" AFTER {}", quote_literal(&labels[previous])),
                    (None, Some(first)) => format!(" BEFORE {}", quote_literal(first)),
                    (None, None) => String::new(),
                };
                self.push(Statement::new(format!(
                    "ALTER TYPE {} ADD VALUE {}{}",
                    name,
                    quote_literal(label),
                    placement
                )));
            }
        }
        Ok(())
    }

    /// Drop triggers, views, constraints and indexes that are going away or
    /// will be recreated with a new definition.
    fn drop_changed_dependents(&mut self) {
        let triggers: Vec<String> = self
            .current
            .triggers
            .iter()
            .filter(|(key, trigger)| {
                !self.is_dropped_table(&trigger.table)
                    && !self.is_recreated_view(&trigger.table)
                    && self
                        .desired
                        .triggers
                        .get(*key)
                        .is_none_or(|d| d.definition != trigger.definition)
            })
            .map(|(_, trigger)| {
                format!(
                    "DROP TRIGGER {} ON {}",
                    quote_identifier(&trigger.name),
                    trigger.table
                )
            })
            .collect();
        for ddl in triggers {
            self.push(Statement::new(ddl));
        }

        let mut views: Vec<(&QualifiedName, bool, i64)> = self
            .current
            .views
            .iter()
            .filter(|(name, view)| {
                self.desired
                    .views
                    .get(*name)
                    .is_none_or(|d| d.definition != view.definition || d.materialized != view.materialized)
            })
            .map(|(name, view)| (name, view.materialized, view.order))
            .collect();
        views.sort_by(|a, b| b.2.cmp(&a.2));
        for (name, materialized, _) in views {
            let kind = if materialized { "MATERIALIZED VIEW" } else { "VIEW" };
            self.push(Statement::new(format!("DROP {} {}", kind, name)));
        }

        // Foreign keys first: they depend on the keys and indexes dropped below.
        let mut constraints = Vec::new();
        for (table_name, table) in &self.current.tables {
            if self.is_dropped_table(table_name) {
                continue;
            }
            let desired = &self.desired.tables[table_name];
            for (name, constraint) in &table.constraints {
                let changed = desired
                    .constraints
                    .get(name)
                    .is_none_or(|d| d != constraint);
                if changed {
                    constraints.push((
                        constraint.kind != ConstraintKind::ForeignKey,
                        format!(
                            "ALTER TABLE {} DROP CONSTRAINT {}",
                            table_name,
                            quote_identifier(name)
                        ),
                    ));
                }
            }
        }
        constraints.sort_by_key(|(not_fk, _)| *not_fk);
        for (_, ddl) in constraints {
            self.push(Statement::new(ddl));
        }

        let indexes: Vec<Statement> = self
            .current
            .indexes
            .iter()
            .filter(|(name, index)| {
                !self.is_dropped_table(&index.table)
                    && !self.is_dropped_view(&index.table)
                    && !self.is_recreated_view(&index.table)
                    && self
                        .desired
                        .indexes
                        .get(*name)
                        .is_none_or(|d| d.definition != index.definition)
            })
            .map(|(name, _)| self.drop_index(name))
            .collect();
        for statement in indexes {
            self.push(statement);
        }
    }

    fn is_dropped_view(&self, name: &QualifiedName) -> bool {
        self.current.views.contains_key(name) && !self.desired.views.contains_key(name)
    }

    fn drop_index(&self, name: &QualifiedName) -> Statement {
        let concurrently = if self.options.concurrent_index_ops {
            "CONCURRENTLY "
        } else {
            ""
        };
        Statement::new(format!("DROP INDEX {}{}", concurrently, name)).with_hazard(Hazard::new(
            HazardType::IndexDropped,
            "Dropping this index means queries that use this index might perform worse because they will no longer will be able to leverage it.",
        ))
    }

    fn sequence_options(sequence: &Sequence) -> String {
        format!(
            "AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} CACHE {} {}",
            sequence.data_type,
            sequence.increment,
            sequence.min,
            sequence.max,
            sequence.start,
            sequence.cache,
            if sequence.cycle { "CYCLE" } else { "NO CYCLE" }
        )
    }

    fn create_sequences(&mut self) {
        for (name, sequence) in &self.desired.sequences {
            match self.current.sequences.get(name) {
                None => self.push(Statement::new(format!(
                    "CREATE SEQUENCE {} {}",
                    name,
                    Self::sequence_options(sequence)
                ))),
                Some(existing) => {
                    let same = Sequence {
                        owned_by: sequence.owned_by.clone(),
                        ..existing.clone()
                    } == *sequence;
                    if !same {
                        self.push(Statement::new(format!(
                            "ALTER SEQUENCE {} {}",
                            name,
                            Self::sequence_options(sequence)
                        )));
                    }
                }
            }
        }
    }

    fn create_functions(&mut self) {
        let mut functions: Vec<_> = self
            .desired
            .functions
            .iter()
            .filter(|(signature, function)| {
                self.current
                    .functions
                    .get(*signature)
                    .is_none_or(|c| c.definition != function.definition)
            })
            .map(|(_, function)| function)
            .collect();
        functions.sort_by_key(|f| f.order);
        for function in functions {
            self.push(
                Statement::new(function.definition.clone()).with_hazard(Hazard::new(
                    HazardType::HasUntrackableDependencies,
                    "Dependencies, i.e. other functions used in the function body, of non-sql functions cannot be tracked. As a result, we cannot guarantee that function dependencies are ordered properly relative to this statement. For adds, this means you need to ensure that all functions this function depends on are created/altered before this statement.",
                )),
            );
        }
    }

    fn column_definition(column: &Column) -> String {
        let mut parts = vec![quote_identifier(&column.name), column.data_type.clone()];
        if let Some(collation) = &column.collation {
            parts.push(format!("COLLATE {}", quote_identifier(collation)));
        }
        if let Some(expression) = &column.generated {
            parts.push(format!("GENERATED ALWAYS AS ({}) STORED", expression));
        }
        match column.identity {
            Some('a') => parts.push("GENERATED ALWAYS AS IDENTITY".to_string()),
            Some('d') => parts.push("GENERATED BY DEFAULT AS IDENTITY".to_string()),
            _ => {}
        }
        if let Some(default) = &column.default {
            parts.push(format!("DEFAULT {}", default));
        }
        if column.not_null {
            parts.push("NOT NULL".to_string());
        }
        parts.join(" ")
    }

    fn create_tables(&mut self) {
        let mut new_tables: Vec<(&QualifiedName, &Table)> = self
            .desired
            .tables
            .iter()
            .filter(|(name, _)| self.is_new_table(name))
            .collect();
        // Partition parents before their partitions.
        new_tables.sort_by_key(|(name, table)| (table.partition_of.is_some(), (*name).clone()));

        for (name, table) in new_tables {
            let ddl = match &table.partition_of {
                Some((parent, bound)) => format!("CREATE TABLE {} PARTITION OF {} {}", name, parent, bound),
                None => {
                    let columns: Vec<String> = table
                        .columns
                        .iter()
                        .map(|c| format!("    {}", Self::column_definition(c)))
                        .collect();
                    let mut ddl = if columns.is_empty() {
                        format!("CREATE TABLE {} ()", name)
                    } else {
                        format!("CREATE TABLE {} (\n{}\n)", name, columns.join(",\n"))
                    };
                    if let Some(key) = &table.partition_key {
                        ddl.push_str(&format!(" PARTITION BY {}", key));
                    }
                    ddl
                }
            };
            self.push(Statement::new(ddl));
        }
    }

    fn alter_columns(&mut self) -> MigrateResult<()> {
        for (table_name, desired) in &self.desired.tables {
            let Some(current) = self.current.tables.get(table_name) else {
                continue;
            };
            if desired.partition_of.is_some() {
                continue;
            }
            if desired.partition_key != current.partition_key
                || desired.partition_of != current.partition_of
            {
                return Err(MigrationError::diff(format!(
                    "partitioning of {} changed, which cannot be altered in place",
                    table_name
                )));
            }

            for column in &desired.columns {
                match current.column(&column.name) {
                    None => self.add_column(table_name, column),
                    Some(existing) => self.alter_column(table_name, existing, column)?,
                }
            }

            for column in &current.columns {
                if desired.column(&column.name).is_none() {
                    self.push(
                        Statement::new(format!(
                            "ALTER TABLE {} DROP COLUMN {}",
                            table_name,
                            quote_identifier(&column.name)
                        ))
                        .with_hazard(Hazard::new(
                            HazardType::DeletesData,
                            "Deletes all values in the column",
                        )),
                    );
                }
            }
        }
        Ok(())
    }

    fn add_column(&mut self, table: &QualifiedName, column: &Column) {
        let mut statement = Statement::new(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table,
            Self::column_definition(column)
        ));
        if column.generated.is_some() || column.identity.is_some() {
            statement = statement
                .with_statement_timeout(LONG_RUNNING_TIMEOUT)
                .with_hazard(Hazard::new(
                    HazardType::ImpactsDatabasePerformance,
                    "Adding a generated or identity column rewrites the table",
                ));
        }
        self.push(statement);
    }

    fn alter_column(
        &mut self,
        table: &QualifiedName,
        current: &Column,
        desired: &Column,
    ) -> MigrateResult<()> {
        let column = quote_identifier(&desired.name);
        let prefix = format!("ALTER TABLE {} ALTER COLUMN {}", table, column);

        if current.generated != desired.generated {
            return Err(MigrationError::diff(format!(
                "generation expression of {}.{} changed, which cannot be altered in place",
                table, column
            )));
        }

        let type_changed =
            current.data_type != desired.data_type || current.collation != desired.collation;
        let default_changed = current.default != desired.default;

        if current.default.is_some() && (default_changed || type_changed) {
            self.push(Statement::new(format!("{} DROP DEFAULT", prefix)));
        }

        if current.identity.is_some() && desired.identity.is_none() {
            self.push(Statement::new(format!("{} DROP IDENTITY", prefix)));
        }

        if type_changed {
            let collation = desired
                .collation
                .as_ref()
                .map(|c| format!(" COLLATE {}", quote_identifier(c)))
                .unwrap_or_default();
            self.push(
                Statement::new(format!(
                    "{} SET DATA TYPE {}{} USING {}::{}",
                    prefix, desired.data_type, collation, column, desired.data_type
                ))
                .with_statement_timeout(LONG_RUNNING_TIMEOUT)
                .with_hazard(Hazard::new(
                    HazardType::AcquiresAccessExclusiveLock,
                    "This will completely lock the table while the data is being re-written. The duration of this conversion depends on if the type conversion is trivial or not. A non-trivial conversion will require a table rewrite.",
                ))
                .with_hazard(Hazard::new(
                    HazardType::ImpactsDatabasePerformance,
                    "This will completely lock the table while the data is being re-written for a duration of time that scales with the size of your data.",
                )),
            );
        }

        match (current.identity, desired.identity) {
            (None, Some(kind)) => {
                let generated = if kind == 'a' { "ALWAYS" } else { "BY DEFAULT" };
                self.push(Statement::new(format!(
                    "{} ADD GENERATED {} AS IDENTITY",
                    prefix, generated
                )));
            }
            (Some(old), Some(new)) if old != new => {
                let generated = if new == 'a' { "ALWAYS" } else { "BY DEFAULT" };
                self.push(Statement::new(format!("{} SET GENERATED {}", prefix, generated)));
            }
            _ => {}
        }

        if let Some(default) = &desired.default {
            if default_changed || type_changed {
                self.push(Statement::new(format!("{} SET DEFAULT {}", prefix, default)));
            }
        }

        if current.not_null != desired.not_null {
            if desired.not_null {
                self.push(
                    Statement::new(format!("{} SET NOT NULL", prefix))
                        .with_statement_timeout(LONG_RUNNING_TIMEOUT)
                        .with_hazard(Hazard::new(
                            HazardType::AcquiresAccessExclusiveLock,
                            "Marking a column as not-null requires a full table scan, which will lock out writes.",
                        )),
                );
            } else {
                self.push(Statement::new(format!("{} DROP NOT NULL", prefix)));
            }
        }
        Ok(())
    }

    fn add_constraints(&mut self, foreign_keys: bool) {
        let mut statements = Vec::new();
        for (table_name, table) in &self.desired.tables {
            let existing = self.current.tables.get(table_name);
            let mut constraints: Vec<_> = table
                .constraints
                .iter()
                .filter(|(_, c)| (c.kind == ConstraintKind::ForeignKey) == foreign_keys)
                .filter(|(name, c)| {
                    existing
                        .and_then(|t| t.constraints.get(*name))
                        .is_none_or(|e| e != *c)
                })
                .collect();
            constraints.sort_by_key(|(name, c)| (c.kind, (*name).clone()));

            for (name, constraint) in constraints {
                let mut statement = Statement::new(format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} {}",
                    table_name,
                    quote_identifier(name),
                    constraint.definition
                ));
                if existing.is_some() {
                    statement = statement
                        .with_statement_timeout(LONG_RUNNING_TIMEOUT)
                        .with_hazard(Hazard::new(
                            HazardType::AcquiresAccessExclusiveLock,
                            "Adding a constraint to an existing table validates every row while holding a lock.",
                        ));
                }
                statements.push(statement);
            }
        }
        for statement in statements {
            self.push(statement);
        }
    }

    /// Create indexes on tables (`on_tables`) or on materialized views.
    fn create_indexes(&mut self, on_tables: bool) {
        let concurrently = self.options.concurrent_index_ops;
        let mut statements = Vec::new();
        for (name, index) in &self.desired.indexes {
            if self.desired.tables.contains_key(&index.table) != on_tables {
                continue;
            }
            let unchanged = !self.is_recreated_view(&index.table)
                && self
                    .current
                    .indexes
                    .get(name)
                    .is_some_and(|c| c.definition == index.definition);
            if unchanged {
                continue;
            }

            let mut ddl = index.definition.clone();
            if concurrently {
                ddl = ddl.replacen(" INDEX ", " INDEX CONCURRENTLY ", 1);
            }
            let mut statement = Statement::new(ddl);
            let existing_relation = if on_tables {
                !self.is_new_table(&index.table)
            } else {
                self.current.views.get(&index.table).is_some_and(|v| {
                    self.desired
                        .views
                        .get(&index.table)
                        .is_some_and(|d| d.definition == v.definition)
                })
            };
            if existing_relation {
                let message = if concurrently {
                    "This might affect database performance. Concurrent index builds require a non-trivial amount of CPU, potentially affecting database performance. They also can take a while but do not lock out writes."
                } else {
                    "This might affect database performance. The index is built without CONCURRENTLY, so writes to the table are blocked until it completes."
                };
                statement = statement
                    .with_statement_timeout(LONG_RUNNING_TIMEOUT)
                    .with_hazard(Hazard::new(HazardType::IndexBuild, message));
            }
            statements.push(statement);
        }
        for statement in statements {
            self.push(statement);
        }
    }

    fn set_sequence_owners(&mut self) {
        let mut statements = Vec::new();
        for (name, sequence) in &self.desired.sequences {
            let current_owner = self
                .current
                .sequences
                .get(name)
                .and_then(|s| s.owned_by.as_ref());
            if current_owner == sequence.owned_by.as_ref() {
                continue;
            }
            let owner = match &sequence.owned_by {
                Some((table, column)) => format!("{}.{}", table, quote_identifier(column)),
                None => "NONE".to_string(),
            };
            statements.push(Statement::new(format!(
                "ALTER SEQUENCE {} OWNED BY {}",
                name, owner
            )));
        }
        for statement in statements {
            self.push(statement);
        }
    }

    fn create_views(&mut self) {
        let mut views: Vec<_> = self
            .desired
            .views
            .iter()
            .filter(|(name, view)| {
                self.current
                    .views
                    .get(*name)
                    .is_none_or(|c| c.definition != view.definition || c.materialized != view.materialized)
            })
            .collect();
        views.sort_by_key(|(_, view)| view.order);

        let mut statements = Vec::new();
        for (name, view) in views {
            let kind = if view.materialized {
                "MATERIALIZED VIEW"
            } else {
                "VIEW"
            };
            let query = view.definition.trim().trim_end_matches(';');
            statements.push(Statement::new(format!(
                "CREATE {} {} AS\n{}",
                kind, name, query
            )));
        }
        for statement in statements {
            self.push(statement);
        }
    }

    fn create_triggers(&mut self) {
        let statements: Vec<Statement> = self
            .desired
            .triggers
            .iter()
            .filter(|(key, trigger)| {
                self.is_recreated_view(&trigger.table)
                    || self
                        .current
                        .triggers
                        .get(*key)
                        .is_none_or(|c| c.definition != trigger.definition)
            })
            .map(|(_, trigger)| Statement::new(trigger.definition.clone()))
            .collect();
        for statement in statements {
            self.push(statement);
        }
    }

    fn drop_removed(&mut self) {
        let dropped_tables: BTreeSet<&QualifiedName> = self
            .current
            .tables
            .keys()
            .filter(|name| self.is_dropped_table(name))
            .collect();

        // Foreign keys between dropped tables would block the drops.
        let mut statements = Vec::new();
        for name in &dropped_tables {
            for (constraint, definition) in &self.current.tables[*name].constraints {
                if definition.kind == ConstraintKind::ForeignKey {
                    statements.push(Statement::new(format!(
                        "ALTER TABLE {} DROP CONSTRAINT {}",
                        name,
                        quote_identifier(constraint)
                    )));
                }
            }
        }

        for name in &dropped_tables {
            let table = &self.current.tables[*name];
            let parent_dropped = table
                .partition_of
                .as_ref()
                .is_some_and(|(parent, _)| dropped_tables.contains(parent));
            if parent_dropped {
                continue;
            }
            statements.push(
                Statement::new(format!("DROP TABLE {}", name)).with_hazard(Hazard::new(
                    HazardType::DeletesData,
                    "Deletes all rows in the table (and the table itself)",
                )),
            );
        }

        for (name, sequence) in &self.current.sequences {
            if self.desired.sequences.contains_key(name) {
                continue;
            }
            let owner_dropped = sequence
                .owned_by
                .as_ref()
                .is_some_and(|(table, _)| dropped_tables.contains(table));
            if owner_dropped {
                continue;
            }
            statements.push(
                Statement::new(format!("DROP SEQUENCE {}", name)).with_hazard(Hazard::new(
                    HazardType::DeletesData,
                    "By deleting a sequence, its value will be permanently lost",
                )),
            );
        }

        for (signature, function) in &self.current.functions {
            if self.desired.functions.contains_key(signature) {
                continue;
            }
            let kind = if function.procedure {
                "PROCEDURE"
            } else {
                "FUNCTION"
            };
            statements.push(
                Statement::new(format!("DROP {} {}", kind, signature)).with_hazard(Hazard::new(
                    HazardType::HasUntrackableDependencies,
                    "Dependencies of functions are not tracked. Dropping a function that is still referenced will fail.",
                )),
            );
        }

        for name in self.current.enums.keys() {
            if !self.desired.enums.contains_key(name) {
                statements.push(Statement::new(format!("DROP TYPE {}", name)));
            }
        }

        for name in self.current.extensions.keys() {
            if !self.desired.extensions.contains_key(name) {
                statements.push(Statement::new(format!(
                    "DROP EXTENSION {}",
                    quote_identifier(name)
                )));
            }
        }

        for schema in self.current.schemas.difference(&self.desired.schemas) {
            statements.push(Statement::new(format!(
                "DROP SCHEMA {}",
                quote_identifier(schema)
            )));
        }

        for statement in statements {
            self.push(statement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DEFAULT_TIMEOUT;
    use crate::introspect::{Constraint, Extension, Function, Index, Trigger, View};
    use pretty_assertions::assert_eq;

    fn column(name: &str, data_type: &str) -> Column {
        Column {
            name: name.to_string(),
            data_type: data_type.to_string(),
            not_null: false,
            default: None,
            identity: None,
            generated: None,
            collation: None,
        }
    }

    fn users(columns: Vec<Column>) -> (QualifiedName, Table) {
        let mut table = Table {
            columns,
            ..Default::default()
        };
        table.constraints.insert(
            "users_pkey".to_string(),
            Constraint {
                kind: ConstraintKind::PrimaryKey,
                definition: "PRIMARY KEY (id)".to_string(),
            },
        );
        (QualifiedName::new("public", "users"), table)
    }

    fn snapshot(tables: Vec<(QualifiedName, Table)>) -> CatalogSnapshot {
        let mut snapshot = CatalogSnapshot::default();
        snapshot.schemas.insert("public".to_string());
        snapshot.tables.extend(tables);
        snapshot
    }

    fn ddl(plan: &Plan) -> Vec<&str> {
        plan.statements.iter().map(|s| s.ddl.as_str()).collect()
    }

    fn id_column() -> Column {
        Column {
            not_null: true,
            ..column("id", "integer")
        }
    }

    #[test]
    fn test_identical_schemas_produce_empty_plan() {
        let a = snapshot(vec![users(vec![id_column()])]);
        let plan = plan_changes(&a, &a.clone(), &DiffOptions::default()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_initial_table() {
        let current = snapshot(vec![]);
        let desired = snapshot(vec![users(vec![id_column(), column("name", "text")])]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "CREATE TABLE \"public\".\"users\" (\n    \"id\" integer NOT NULL,\n    \"name\" text\n)",
                "ALTER TABLE \"public\".\"users\" ADD CONSTRAINT \"users_pkey\" PRIMARY KEY (id)",
            ]
        );
        assert!(plan.statements.iter().all(|s| s.hazards.is_empty()));
    }

    #[test]
    fn test_add_column_only() {
        let current = snapshot(vec![users(vec![id_column()])]);
        let desired = snapshot(vec![users(vec![id_column(), column("email", "text")])]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec!["ALTER TABLE \"public\".\"users\" ADD COLUMN \"email\" text"]
        );
        assert_eq!(plan.statements[0].statement_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_drop_column_is_hazardous() {
        let current = snapshot(vec![users(vec![id_column(), column("email", "text")])]);
        let desired = snapshot(vec![users(vec![id_column()])]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.statements[0].hazards[0].kind, HazardType::DeletesData);
    }

    #[test]
    fn test_type_change_resets_default() {
        let mut old = column("score", "integer");
        old.default = Some("0".to_string());
        let mut new = column("score", "bigint");
        new.default = Some("0".to_string());
        new.not_null = true;

        let current = snapshot(vec![users(vec![id_column(), old])]);
        let desired = snapshot(vec![users(vec![id_column(), new])]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "ALTER TABLE \"public\".\"users\" ALTER COLUMN \"score\" DROP DEFAULT",
                "ALTER TABLE \"public\".\"users\" ALTER COLUMN \"score\" SET DATA TYPE bigint USING \"score\"::bigint",
                "ALTER TABLE \"public\".\"users\" ALTER COLUMN \"score\" SET DEFAULT 0",
                "ALTER TABLE \"public\".\"users\" ALTER COLUMN \"score\" SET NOT NULL",
            ]
        );
        assert_eq!(plan.statements[1].statement_timeout, LONG_RUNNING_TIMEOUT);
        assert_eq!(plan.statements[1].hazards.len(), 2);
    }

    #[test]
    fn test_bookkeeping_drop_is_filtered() {
        let mut current = snapshot(vec![users(vec![id_column()])]);
        current.tables.insert(
            QualifiedName::new("public", "schema_migrations"),
            Table {
                columns: vec![column("version", "bigint"), column("dirty", "boolean")],
                ..Default::default()
            },
        );
        let desired = snapshot(vec![users(vec![id_column()])]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec!["DROP TABLE \"public\".\"schema_migrations\""]
        );
        assert!(plan.without_bookkeeping("schema_migrations").is_empty());
    }

    #[test]
    fn test_index_on_existing_table_is_not_concurrent() {
        let current = snapshot(vec![users(vec![id_column(), column("email", "text")])]);
        let mut desired = current.clone();
        desired.indexes.insert(
            QualifiedName::new("public", "users_email_idx"),
            Index {
                table: QualifiedName::new("public", "users"),
                definition: "CREATE INDEX users_email_idx ON public.users USING btree (email)"
                    .to_string(),
            },
        );
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(!plan.statements[0].ddl.contains("CONCURRENTLY"));
        assert_eq!(plan.statements[0].hazards[0].kind, HazardType::IndexBuild);
        assert_eq!(plan.statements[0].statement_timeout, LONG_RUNNING_TIMEOUT);

        let options = DiffOptions::default().concurrent_index_ops(true);
        let plan = plan_changes(&current, &desired, &options).unwrap();
        assert!(plan.statements[0].ddl.starts_with("CREATE INDEX CONCURRENTLY"));
    }

    #[test]
    fn test_changed_index_is_dropped_then_created() {
        let mut current = snapshot(vec![users(vec![id_column(), column("email", "text")])]);
        let name = QualifiedName::new("public", "users_email_idx");
        current.indexes.insert(
            name.clone(),
            Index {
                table: QualifiedName::new("public", "users"),
                definition: "CREATE INDEX users_email_idx ON public.users USING btree (email)"
                    .to_string(),
            },
        );
        let mut desired = current.clone();
        desired.indexes.get_mut(&name).unwrap().definition =
            "CREATE UNIQUE INDEX users_email_idx ON public.users USING btree (email)".to_string();

        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "DROP INDEX \"public\".\"users_email_idx\"",
                "CREATE UNIQUE INDEX users_email_idx ON public.users USING btree (email)",
            ]
        );
        assert_eq!(plan.statements[0].hazards[0].kind, HazardType::IndexDropped);
    }

    #[test]
    fn test_foreign_keys_after_tables() {
        let current = snapshot(vec![]);
        let mut orders = Table {
            columns: vec![id_column(), column("user_id", "integer")],
            ..Default::default()
        };
        orders.constraints.insert(
            "orders_user_id_fkey".to_string(),
            Constraint {
                kind: ConstraintKind::ForeignKey,
                definition: "FOREIGN KEY (user_id) REFERENCES users(id)".to_string(),
            },
        );
        let desired = snapshot(vec![
            (QualifiedName::new("public", "orders"), orders),
            users(vec![id_column()]),
        ]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        let statements = ddl(&plan);
        let fk = statements
            .iter()
            .position(|s| s.contains("FOREIGN KEY"))
            .unwrap();
        let pk = statements
            .iter()
            .position(|s| s.contains("PRIMARY KEY"))
            .unwrap();
        assert!(pk < fk);
        assert_eq!(fk, statements.len() - 1);
    }

    #[test]
    fn test_enum_add_value() {
        let mut current = snapshot(vec![]);
        let name = QualifiedName::new("public", "status");
        current
            .enums
            .insert(name.clone(), vec!["active".to_string(), "deleted".to_string()]);
        let mut desired = current.clone();
        desired.enums.insert(
            name.clone(),
            vec![
                "pending".to_string(),
                "active".to_string(),
                "archived".to_string(),
                "deleted".to_string(),
            ],
        );
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "ALTER TYPE \"public\".\"status\" ADD VALUE 'pending' BEFORE 'active'",
                "ALTER TYPE \"public\".\"status\" ADD VALUE 'archived' AFTER 'active'",
            ]
        );
    }

    #[test]
    fn test_enum_without_labels_gains_values() {
        let mut current = snapshot(vec![]);
        let name = QualifiedName::new("public", "mood");
        current.enums.insert(name.clone(), Vec::new());
        let mut desired = current.clone();
        desired
            .enums
            .insert(name, vec!["happy".to_string(), "sad".to_string()]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "ALTER TYPE \"public\".\"mood\" ADD VALUE 'happy'",
                "ALTER TYPE \"public\".\"mood\" ADD VALUE 'sad' AFTER 'happy'",
            ]
        );
    }

    #[test]
    fn test_enum_value_removal_is_rejected() {
        let mut current = snapshot(vec![]);
        let name = QualifiedName::new("public", "status");
        current
            .enums
            .insert(name.clone(), vec!["a".to_string(), "b".to_string()]);
        let mut desired = current.clone();
        desired.enums.insert(name, vec!["a".to_string()]);
        let err = plan_changes(&current, &desired, &DiffOptions::default()).unwrap_err();
        assert!(matches!(err, MigrationError::DiffGeneration(_)));
    }

    #[test]
    fn test_serial_sequence_ownership() {
        let current = snapshot(vec![]);
        let mut id = id_column();
        id.default = Some("nextval('users_id_seq'::regclass)".to_string());
        let mut desired = snapshot(vec![users(vec![id])]);
        desired.sequences.insert(
            QualifiedName::new("public", "users_id_seq"),
            Sequence {
                data_type: "integer".to_string(),
                start: 1,
                increment: 1,
                min: 1,
                max: 2147483647,
                cache: 1,
                cycle: false,
                owned_by: Some((QualifiedName::new("public", "users"), "id".to_string())),
            },
        );
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        let statements = ddl(&plan);
        assert!(statements[0].starts_with("CREATE SEQUENCE \"public\".\"users_id_seq\" AS integer"));
        assert!(statements[1].starts_with("CREATE TABLE"));
        assert_eq!(
            statements.last().copied(),
            Some("ALTER SEQUENCE \"public\".\"users_id_seq\" OWNED BY \"public\".\"users\".\"id\"")
        );
    }

    #[test]
    fn test_view_and_trigger_recreated_on_change() {
        let mut current = snapshot(vec![users(vec![id_column()])]);
        let view = QualifiedName::new("public", "active_users");
        current.views.insert(
            view.clone(),
            View {
                materialized: false,
                definition: " SELECT users.id\n   FROM users;".to_string(),
                order: 10,
            },
        );
        let key = (QualifiedName::new("public", "users"), "touch".to_string());
        current.triggers.insert(
            key.clone(),
            Trigger {
                table: key.0.clone(),
                name: key.1.clone(),
                definition: "CREATE TRIGGER touch BEFORE UPDATE ON users FOR EACH ROW EXECUTE FUNCTION touch()".to_string(),
            },
        );
        let mut desired = current.clone();
        desired.views.get_mut(&view).unwrap().definition =
            " SELECT users.id\n   FROM users\n  WHERE users.id > 0;".to_string();
        desired.triggers.get_mut(&key).unwrap().definition =
            "CREATE TRIGGER touch BEFORE INSERT OR UPDATE ON users FOR EACH ROW EXECUTE FUNCTION touch()".to_string();

        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "DROP TRIGGER \"touch\" ON \"public\".\"users\"",
                "DROP VIEW \"public\".\"active_users\"",
                "CREATE VIEW \"public\".\"active_users\" AS\nSELECT users.id\n   FROM users\n  WHERE users.id > 0",
                "CREATE TRIGGER touch BEFORE INSERT OR UPDATE ON users FOR EACH ROW EXECUTE FUNCTION touch()",
            ]
        );
    }

    fn view_with_trigger(definition: &str) -> CatalogSnapshot {
        let mut snapshot = snapshot(vec![users(vec![id_column()])]);
        let view = QualifiedName::new("public", "user_list");
        snapshot.views.insert(
            view.clone(),
            View {
                materialized: false,
                definition: definition.to_string(),
                order: 10,
            },
        );
        snapshot.triggers.insert(
            (view.clone(), "user_list_insert".to_string()),
            Trigger {
                table: view,
                name: "user_list_insert".to_string(),
                definition: "CREATE TRIGGER user_list_insert INSTEAD OF INSERT ON user_list FOR EACH ROW EXECUTE FUNCTION insert_user()".to_string(),
            },
        );
        snapshot
    }

    #[test]
    fn test_unchanged_trigger_on_recreated_view_is_restored() {
        let current = view_with_trigger(" SELECT users.id\n   FROM users;");
        let desired = view_with_trigger(" SELECT users.id\n   FROM users\n  WHERE users.id > 0;");

        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "DROP VIEW \"public\".\"user_list\"",
                "CREATE VIEW \"public\".\"user_list\" AS\nSELECT users.id\n   FROM users\n  WHERE users.id > 0",
                "CREATE TRIGGER user_list_insert INSTEAD OF INSERT ON user_list FOR EACH ROW EXECUTE FUNCTION insert_user()",
            ]
        );
    }

    #[test]
    fn test_changed_trigger_on_kept_view_is_replaced() {
        let current = view_with_trigger(" SELECT users.id\n   FROM users;");
        let mut desired = current.clone();
        for trigger in desired.triggers.values_mut() {
            trigger.definition = "CREATE TRIGGER user_list_insert INSTEAD OF INSERT OR UPDATE ON user_list FOR EACH ROW EXECUTE FUNCTION insert_user()".to_string();
        }

        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "DROP TRIGGER \"user_list_insert\" ON \"public\".\"user_list\"",
                "CREATE TRIGGER user_list_insert INSTEAD OF INSERT OR UPDATE ON user_list FOR EACH ROW EXECUTE FUNCTION insert_user()",
            ]
        );
    }

    #[test]
    fn test_index_on_recreated_materialized_view_is_restored() {
        let mut current = snapshot(vec![users(vec![id_column()])]);
        let view = QualifiedName::new("public", "user_ids");
        current.views.insert(
            view.clone(),
            View {
                materialized: true,
                definition: " SELECT users.id\n   FROM users;".to_string(),
                order: 10,
            },
        );
        current.indexes.insert(
            QualifiedName::new("public", "user_ids_id_idx"),
            Index {
                table: view.clone(),
                definition: "CREATE INDEX user_ids_id_idx ON public.user_ids USING btree (id)".to_string(),
            },
        );
        let mut desired = current.clone();
        desired.views.get_mut(&view).unwrap().definition =
            " SELECT users.id\n   FROM users\n  WHERE users.id > 0;".to_string();

        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        let statements = ddl(&plan);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "DROP MATERIALIZED VIEW \"public\".\"user_ids\"");
        assert_eq!(
            statements[2],
            "CREATE INDEX user_ids_id_idx ON public.user_ids USING btree (id)"
        );
        assert!(plan.statements[2].hazards.is_empty());
    }

    #[test]
    fn test_drops_come_last() {
        let mut current = snapshot(vec![users(vec![id_column()])]);
        current.schemas.insert("legacy".to_string());
        current.extensions.insert(
            "pgcrypto".to_string(),
            Extension {
                schema: "public".to_string(),
                version: "1.3".to_string(),
            },
        );
        let function = Function {
            name: QualifiedName::new("public", "old_fn"),
            identity_args: String::new(),
            procedure: false,
            definition: "CREATE OR REPLACE FUNCTION public.old_fn() ...".to_string(),
            order: 1,
        };
        current.functions.insert(function.signature(), function);

        let desired = snapshot(vec![]);
        let plan = plan_changes(&current, &desired, &DiffOptions::default()).unwrap();
        assert_eq!(
            ddl(&plan),
            vec![
                "DROP TABLE \"public\".\"users\"",
                "DROP FUNCTION \"public\".\"old_fn\"()",
                "DROP EXTENSION \"pgcrypto\"",
                "DROP SCHEMA \"legacy\"",
            ]
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
