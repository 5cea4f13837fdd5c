//! Static validation of generated SQL against the known schema.
//!
//! Checks run in order and stop early on a parse failure:
//! - Parse check (empty input, syntax errors, more than one statement)
//! - Table references that the schema does not know
//! - Column references that the resolved tables do not have
//! - Non-blocking semantic warnings
//!
//! Every SELECT level, CTE body and write target gets its own scope. A qualified column
//! resolves through the aliases of its own scope first and then through the enclosing ones, so
//! an alias reused in a UNION branch or a subquery does not leak into other levels.
//!
//! Findings are deterministic: table findings come before column findings, each group in the
//! order the references first appear in the statement.

use crate::domain::query::{Finding, FindingKind};
use crate::domain::schema::SchemaRecord;
use crate::infrastructure::db::DbBackend;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    visit_expressions, AssignmentTarget, Expr, FromTable, GroupByExpr, Ident, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::ops::ControlFlow;

static POSITION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Line: \d+, Column: \d+").unwrap());

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "group_concat",
    "string_agg",
    "array_agg",
    "bool_and",
    "bool_or",
    "stddev",
    "variance",
];

/// Validates `sql` against `known_schema`, parsed with the grammar of `backend`.
/// An empty result means the candidate is valid.
pub fn validate(sql: &str, known_schema: &[SchemaRecord], backend: DbBackend) -> Vec<Finding> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return vec![Finding::new(
            FindingKind::SyntaxError,
            "Empty SQL statement",
            None,
        )];
    }

    let dialect = parser_dialect(backend);
    let statements = match Parser::parse_sql(dialect.as_ref(), trimmed) {
        Ok(statements) => statements,
        Err(e) => {
            let message = e.to_string();
            let location = POSITION_PATTERN
                .find(&message)
                .map(|m| m.as_str().to_string());
            return vec![Finding::new(FindingKind::SyntaxError, message, location)];
        }
    };

    let statement = match statements.as_slice() {
        [] => {
            return vec![Finding::new(
                FindingKind::SyntaxError,
                "No SQL statement found",
                None,
            )]
        }
        [single] => single,
        many => {
            return vec![Finding::new(
                FindingKind::SyntaxError,
                format!("Expected one SQL statement, found {}", many.len()),
                None,
            )]
        }
    };

    let refs = References::collect(statement);

    let mut findings = Vec::new();
    check_tables(&refs, known_schema, &mut findings);
    check_columns(&refs, known_schema, &mut findings);
    add_warnings(statement, &refs, &mut findings);
    findings
}

/// MySQL reads `"..."` as a string literal, PostgreSQL and SQLite as an identifier.
fn parser_dialect(backend: DbBackend) -> Box<dyn Dialect> {
    match backend {
        DbBackend::Postgres => Box::new(PostgreSqlDialect {}),
        DbBackend::Mysql => Box::new(MySqlDialect {}),
        DbBackend::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Suggests the known name closest to `name`.
///
/// Names where one contains the other rank first; within each group the smallest Levenshtein
/// distance wins and remaining ties keep `candidates` order.
pub fn nearest_name<'a, I>(name: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let needle = name.to_ascii_lowercase();
    let mut best: Option<((bool, usize), &'a str)> = None;

    for candidate in candidates {
        let lower = candidate.to_ascii_lowercase();
        let unrelated = !(lower.contains(&needle) || needle.contains(&lower));
        let key = (unrelated, levenshtein(&needle, &lower));
        match best {
            Some((best_key, _)) if best_key <= key => {}
            _ => best = Some((key, candidate)),
        }
    }

    best.map(|(_, candidate)| candidate)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for j in 1..=b.len() {
            let cost = if ca == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[derive(Debug)]
struct ColumnRef {
    scope: usize,
    qualifier: Option<String>,
    name: String,
}

#[derive(Debug)]
enum Source {
    Table(String),
    /// CTE, derived table or nested join: no fixed column list.
    Virtual,
}

/// Names visible at one SELECT level or write target. Lookups fall back to `parent`.
#[derive(Debug, Default)]
struct Scope {
    parent: Option<usize>,
    sources: Vec<(String, Source)>,
    /// Some source has no known column list, so unqualified names cannot be checked.
    opaque: bool,
    /// Some source could not be named, so unknown qualifiers cannot be reported.
    unnamed: bool,
    select_aliases: HashSet<String>,
}

impl Scope {
    fn lookup(&self, name: &str) -> Option<&Source> {
        self.sources
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, source)| source)
    }

    fn tables(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().filter_map(|(_, source)| match source {
            Source::Table(table) => Some(table.as_str()),
            Source::Virtual => None,
        })
    }
}

enum Resolution<'r> {
    Table(&'r str),
    Virtual,
    Unknown,
}

/// Everything the checks need. Relations and CTE names come from one visitor pass over the
/// statement; scopes and column references from a structured walk.
#[derive(Default)]
struct References {
    tables: Vec<String>,
    cte_names: HashSet<String>,
    scopes: Vec<Scope>,
    columns: Vec<ColumnRef>,
    unconditioned_joins: usize,
}

impl References {
    fn collect(statement: &Statement) -> Self {
        let mut refs = References::default();
        let _ = statement.visit(&mut refs);
        refs.scan_statement(statement);
        refs
    }

    fn push_scope(&mut self, parent: Option<usize>) -> usize {
        self.scopes.push(Scope {
            parent,
            ..Scope::default()
        });
        self.scopes.len() - 1
    }

    fn push_column(&mut self, scope: usize, idents: &[Ident]) {
        let Some(name) = idents.last() else {
            return;
        };
        let qualifier = idents
            .len()
            .checked_sub(2)
            .map(|i| idents[i].value.clone());
        self.columns.push(ColumnRef {
            scope,
            qualifier,
            name: name.value.clone(),
        });
    }

    fn scan_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => self.scan_query(query, None),
            Statement::Insert(insert) => {
                let scope = self.push_scope(None);
                if let Some(table) = last_ident(&insert.table_name) {
                    let key = insert
                        .table_alias
                        .as_ref()
                        .map(|alias| alias.value.clone())
                        .unwrap_or_else(|| table.clone());
                    self.add_source(scope, key, &table);
                }
                for column in &insert.columns {
                    self.push_column(scope, std::slice::from_ref(column));
                }
                if let Some(source) = &insert.source {
                    self.scan_query(source, None);
                }
            }
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => {
                let scope = self.push_scope(None);
                self.add_from(scope, table);
                if let Some(from) = from {
                    self.add_from(scope, from);
                }
                for assignment in assignments {
                    let targets = match &assignment.target {
                        AssignmentTarget::ColumnName(name) => std::slice::from_ref(name),
                        AssignmentTarget::Tuple(names) => names.as_slice(),
                    };
                    for target in targets {
                        self.push_column(scope, &target.0);
                    }
                    self.scan_level(scope, &assignment.value);
                }
                self.scan_level(scope, table);
                self.scan_level(scope, from);
                self.scan_level(scope, selection);
            }
            Statement::Delete(delete) => {
                let scope = self.push_scope(None);
                let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) =
                    &delete.from;
                for table in tables.iter().chain(delete.using.iter().flatten()) {
                    self.add_from(scope, table);
                }
                self.scan_level(scope, tables);
                self.scan_level(scope, &delete.using);
                self.scan_level(scope, &delete.selection);
            }
            _ => {}
        }
    }

    fn scan_query(&mut self, query: &Query, parent: Option<usize>) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.scan_query(&cte.query, parent);
            }
        }
        let body_scope = self.scan_set_expr(&query.body, parent);
        // ORDER BY after a set operation names output columns, not table columns.
        if let (Some(scope), Some(order_by)) = (body_scope, &query.order_by) {
            for item in &order_by.exprs {
                self.scan_level(scope, &item.expr);
            }
        }
    }

    fn scan_set_expr(&mut self, body: &SetExpr, parent: Option<usize>) -> Option<usize> {
        match body {
            SetExpr::Select(select) => Some(self.scan_select(select, parent)),
            SetExpr::Query(query) => {
                self.scan_query(query, parent);
                None
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.scan_set_expr(left, parent);
                self.scan_set_expr(right, parent);
                None
            }
            _ => None,
        }
    }

    fn scan_select(&mut self, select: &Select, parent: Option<usize>) -> usize {
        let scope = self.push_scope(parent);
        for item in &select.projection {
            if let SelectItem::ExprWithAlias { alias, .. } = item {
                self.scopes[scope]
                    .select_aliases
                    .insert(alias.value.to_ascii_lowercase());
            }
        }
        for from in &select.from {
            self.add_from(scope, from);
        }
        self.scan_level(scope, select);
        scope
    }

    /// Records the column references of one level and walks the queries nested in it.
    fn scan_level<T: Visit>(&mut self, scope: usize, node: &T) {
        let mut level = LevelScan::default();
        let _ = node.visit(&mut level);
        for idents in &level.columns {
            self.push_column(scope, idents);
        }
        for query in &level.nested {
            self.scan_query(query, Some(scope));
        }
    }

    fn add_from(&mut self, scope: usize, from: &TableWithJoins) {
        self.add_factor(scope, &from.relation);
        for join in &from.joins {
            if lacks_join_condition(&join.join_operator) {
                self.unconditioned_joins += 1;
            }
            self.add_factor(scope, &join.relation);
        }
    }

    fn add_factor(&mut self, scope: usize, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                if let Some(table) = last_ident(name) {
                    let key = alias
                        .as_ref()
                        .map(|alias| alias.name.value.clone())
                        .unwrap_or_else(|| table.clone());
                    self.add_source(scope, key, &table);
                }
            }
            TableFactor::Derived { alias, .. } => {
                let slot = &mut self.scopes[scope];
                slot.opaque = true;
                match alias {
                    Some(alias) => slot.sources.push((alias.name.value.clone(), Source::Virtual)),
                    None => slot.unnamed = true,
                }
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                self.add_from(scope, table_with_joins);
                if let Some(alias) = alias {
                    let slot = &mut self.scopes[scope];
                    slot.opaque = true;
                    slot.sources
                        .push((alias.name.value.clone(), Source::Virtual));
                }
            }
            _ => {
                let slot = &mut self.scopes[scope];
                slot.opaque = true;
                slot.unnamed = true;
            }
        }
    }

    fn add_source(&mut self, scope: usize, key: String, table: &str) {
        let is_cte = self.cte_names.contains(&table.to_ascii_lowercase());
        let slot = &mut self.scopes[scope];
        if is_cte {
            slot.opaque = true;
            slot.sources.push((key, Source::Virtual));
        } else {
            slot.sources.push((key, Source::Table(table.to_string())));
        }
    }

    fn resolve_qualifier(&self, scope: usize, qualifier: &str) -> Resolution<'_> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let slot = &self.scopes[id];
            match slot.lookup(qualifier) {
                Some(Source::Table(table)) => return Resolution::Table(table),
                Some(Source::Virtual) => return Resolution::Virtual,
                None if slot.unnamed => return Resolution::Virtual,
                None => current = slot.parent,
            }
        }
        if self.cte_names.contains(&qualifier.to_ascii_lowercase()) {
            Resolution::Virtual
        } else {
            Resolution::Unknown
        }
    }

    /// Aliases and table names visible from `scope`, innermost first.
    fn visible_names(&self, scope: usize) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let slot = &self.scopes[id];
            names.extend(slot.sources.iter().map(|(key, _)| key.as_str()));
            current = slot.parent;
        }
        names
    }

    /// The table an unqualified `name` is reported against, or `None` when some visible
    /// source has it or cannot be checked.
    fn missing_unqualified<'s>(
        &self,
        scope: usize,
        name: &str,
        schema: &'s [SchemaRecord],
    ) -> Option<&'s SchemaRecord> {
        let lower = name.to_ascii_lowercase();
        let mut first: Option<&'s SchemaRecord> = None;
        let mut current = Some(scope);
        while let Some(id) = current {
            let slot = &self.scopes[id];
            if slot.opaque || slot.select_aliases.contains(&lower) {
                return None;
            }
            for table in slot.tables() {
                // Unknown tables are reported on their own.
                let record = find_table(schema, table)?;
                if record.find_column(name).is_some() {
                    return None;
                }
                first.get_or_insert(record);
            }
            current = slot.parent;
        }
        first
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names
                    .insert(cte.alias.name.value.to_ascii_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(name) = last_ident(relation) {
            if !self.tables.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
                self.tables.push(name);
            }
        }
        ControlFlow::Continue(())
    }
}

/// Identifier expressions of a single level. Nested queries are handed back, not entered.
#[derive(Default)]
struct LevelScan {
    depth: usize,
    columns: Vec<Vec<Ident>>,
    nested: Vec<Query>,
}

impl Visitor for LevelScan {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            self.nested.push(query.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            match expr {
                Expr::Identifier(ident) => self.columns.push(vec![ident.clone()]),
                Expr::CompoundIdentifier(idents) => self.columns.push(idents.clone()),
                _ => {}
            }
        }
        ControlFlow::Continue(())
    }
}

fn last_ident(name: &ObjectName) -> Option<String> {
    name.0.last().map(|ident| ident.value.clone())
}

fn lacks_join_condition(operator: &JoinOperator) -> bool {
    match operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => matches!(constraint, JoinConstraint::None),
        _ => false,
    }
}

fn find_table<'a>(schema: &'a [SchemaRecord], name: &str) -> Option<&'a SchemaRecord> {
    schema
        .iter()
        .find(|record| record.table_name.eq_ignore_ascii_case(name))
}

fn check_tables(refs: &References, schema: &[SchemaRecord], findings: &mut Vec<Finding>) {
    for table in &refs.tables {
        if refs.cte_names.contains(&table.to_ascii_lowercase()) {
            continue;
        }
        if find_table(schema, table).is_none() {
            let hint = nearest_name(table, schema.iter().map(|r| r.table_name.as_str()));
            findings.push(Finding::new(
                FindingKind::UnknownTable,
                format!("Table `{}` does not exist", table),
                hint.map(str::to_string),
            ));
        }
    }
}

fn check_columns(refs: &References, schema: &[SchemaRecord], findings: &mut Vec<Finding>) {
    let mut reported: HashSet<(String, String)> = HashSet::new();
    let mut unknown_qualifiers: HashSet<String> = HashSet::new();

    for column in &refs.columns {
        let target = match &column.qualifier {
            Some(qualifier) => match refs.resolve_qualifier(column.scope, qualifier) {
                Resolution::Table(table) => match find_table(schema, table) {
                    Some(record) if record.find_column(&column.name).is_none() => record,
                    _ => continue,
                },
                Resolution::Virtual => continue,
                Resolution::Unknown => {
                    if unknown_qualifiers.insert(qualifier.to_ascii_lowercase()) {
                        let hint = nearest_name(qualifier, refs.visible_names(column.scope));
                        findings.push(Finding::new(
                            FindingKind::UnknownColumn,
                            format!(
                                "Column `{}.{}` uses `{}`, which is not a table or alias in scope",
                                qualifier, column.name, qualifier
                            ),
                            hint.map(str::to_string),
                        ));
                    }
                    continue;
                }
            },
            None => match refs.missing_unqualified(column.scope, &column.name, schema) {
                Some(record) => record,
                None => continue,
            },
        };

        let key = (
            target.table_name.to_ascii_lowercase(),
            column.name.to_ascii_lowercase(),
        );
        if !reported.insert(key) {
            continue;
        }

        let hint = nearest_name(&column.name, target.column_names());
        findings.push(Finding::new(
            FindingKind::UnknownColumn,
            format!(
                "Column `{}` does not exist in table `{}`",
                column.name, target.table_name
            ),
            hint.map(str::to_string),
        ));
    }
}

fn add_warnings(statement: &Statement, refs: &References, findings: &mut Vec<Finding>) {
    if let Statement::Query(query) = statement {
        if is_unbounded(query) {
            findings.push(Finding::new(
                FindingKind::SemanticWarning,
                "SELECT has no WHERE or LIMIT and may return every row",
                None,
            ));
        }
    }

    if refs.unconditioned_joins > 0 {
        findings.push(Finding::new(
            FindingKind::SemanticWarning,
            "JOIN without a join condition produces a cross product",
            None,
        ));
    }

    if is_mutation(statement) {
        findings.push(Finding::new(
            FindingKind::SemanticWarning,
            "Statement modifies data",
            None,
        ));
    }
}

fn is_unbounded(query: &Query) -> bool {
    if query.limit.is_some() || query.fetch.is_some() {
        return false;
    }
    match query.body.as_ref() {
        SetExpr::Select(select) => {
            !select.from.is_empty()
                && select.selection.is_none()
                && select.top.is_none()
                && !is_aggregate(select)
        }
        _ => false,
    }
}

fn is_aggregate(select: &Select) -> bool {
    let grouped = match &select.group_by {
        GroupByExpr::All(_) => true,
        GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
    };
    grouped
        || visit_expressions(&select.projection, |expr| match expr {
            Expr::Function(function)
                if function.name.0.last().is_some_and(|ident| {
                    AGGREGATE_FUNCTIONS.contains(&ident.value.to_ascii_lowercase().as_str())
                }) =>
            {
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        })
        .is_break()
}

fn is_mutation(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Insert { .. }
            | Statement::Update { .. }
            | Statement::Delete { .. }
            | Statement::Merge { .. }
            | Statement::Truncate { .. }
            | Statement::Drop { .. }
            | Statement::AlterTable { .. }
            | Statement::CreateTable { .. }
    )
}
