//! SQL statement extractor.
//!
//! Turns a PostgreSQL-dialect SQL string into the set of
//! `(kind, table, column)` operations it performs. The walker keeps a FIFO
//! work list of `(kind, table, node)` states plus side tables for table
//! aliases, column aliases and CTE names, so that references through aliases
//! resolve to real relations and CTE pseudo-tables never leak into results.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Assignment, AssignmentTarget, Cte, Delete, Expr, FromTable, Function, FunctionArg,
    FunctionArgExpr, FunctionArguments, Insert, JoinConstraint, JoinOperator, OnConflictAction,
    OnInsert, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
    WindowType,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{ProxyError, Result};

/// Kind of operation a statement performs on a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Join,
    Update,
    Insert,
    Delete,
}

/// One extracted operation. `column` is empty only for whole-table
/// references such as `SELECT *` or `DELETE FROM t` without a WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QueryStatement {
    #[serde(rename = "statement_type")]
    pub kind: StatementKind,
    pub table: String,
    pub column: String,
}

impl QueryStatement {
    pub fn new(kind: StatementKind, table: impl Into<String>, column: impl Into<String>) -> Self {
        QueryStatement {
            kind,
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Parse `query` and extract every table/column operation it performs.
///
/// The result is a set (no duplicates), returned sorted for determinism.
/// Parse errors surface to the caller; policy decides whether to fail open.
pub fn extract_query_statements(query: &str) -> Result<Vec<QueryStatement>> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, query)
        .map_err(|e| ProxyError::Protocol(format!("parse query: {e}")))?;

    let mut extractor = Extractor::default();
    for statement in &statements {
        extractor.push(None, String::new(), Node::Statement(statement));
    }
    extractor.run();
    Ok(extractor.finish())
}

/// Candidate operation. `current_table` marks that the table was attached
/// from the surrounding statement context rather than written explicitly;
/// the final filter uses it to drop references to column aliases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Op {
    kind: StatementKind,
    table: String,
    column: String,
    current_table: bool,
}

enum Node<'a> {
    Statement(&'a Statement),
    Query(&'a Query),
    SetExpr(&'a SetExpr),
    Expr(&'a Expr),
    Cte(&'a Cte),
    /// Synthetic unqualified column reference (UPDATE/INSERT target columns).
    Column(String),
}

struct Item<'a> {
    kind: Option<StatementKind>,
    table: String,
    node: Node<'a>,
}

#[derive(Default)]
struct Extractor<'a> {
    work: VecDeque<Item<'a>>,
    table_aliases: HashMap<String, String>,
    column_aliases: HashSet<String>,
    ctes: HashSet<String>,
    ops: HashSet<Op>,
}

impl<'a> Extractor<'a> {
    fn push(&mut self, kind: Option<StatementKind>, table: String, node: Node<'a>) {
        self.work.push_back(Item { kind, table, node });
    }

    fn run(&mut self) {
        while let Some(item) = self.work.pop_front() {
            let Item { kind, table, node } = item;
            match node {
                Node::Statement(stmt) => self.handle_statement(kind, &table, stmt),
                Node::Query(query) => self.handle_query(kind, &table, query),
                Node::SetExpr(body) => self.handle_set_expr(kind, &table, body),
                Node::Expr(expr) => self.handle_expr(kind, &table, expr),
                Node::Cte(cte) => {
                    self.ctes.insert(cte.alias.name.value.clone());
                    self.push(kind, table, Node::Query(&cte.query));
                }
                Node::Column(name) => {
                    if let Some(kind) = kind {
                        self.emit(kind, table, name, true, false);
                    }
                }
            }
        }
    }

    fn finish(self) -> Vec<QueryStatement> {
        let mut result: HashSet<QueryStatement> = HashSet::new();
        for op in self.ops {
            if self.ctes.contains(&op.table) {
                continue;
            }
            if op.current_table && self.column_aliases.contains(&op.column) {
                continue;
            }
            result.insert(QueryStatement {
                kind: op.kind,
                table: op.table,
                column: op.column,
            });
        }
        let mut result: Vec<QueryStatement> = result.into_iter().collect();
        result.sort();
        result
    }

    /// Record a candidate operation. Empty-table candidates are dropped when
    /// the kind is Select, the table was explicitly qualified, or the column
    /// collides with a known column alias.
    fn emit(
        &mut self,
        kind: StatementKind,
        table: String,
        column: String,
        current_table: bool,
        table_provided: bool,
    ) {
        if table.is_empty()
            && (kind == StatementKind::Select
                || table_provided
                || self.column_aliases.contains(&column))
        {
            return;
        }
        self.ops.insert(Op {
            kind,
            table,
            column,
            current_table,
        });
    }

    fn handle_statement(&mut self, kind: Option<StatementKind>, table: &str, stmt: &'a Statement) {
        match stmt {
            Statement::Query(query) => self.push(kind, table.to_string(), Node::Query(query)),
            Statement::Insert(insert) => self.handle_insert(kind, table, insert),
            Statement::Update {
                table: target,
                assignments,
                from,
                selection,
                returning,
                ..
            } => self.handle_update(kind, table, target, assignments, from, selection, returning),
            Statement::Delete(delete) => self.handle_delete(delete),
            _ => {}
        }
    }

    fn handle_query(&mut self, kind: Option<StatementKind>, table: &str, query: &'a Query) {
        self.push(kind, table.to_string(), Node::SetExpr(&query.body));
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.push(kind, table.to_string(), Node::Cte(cte));
            }
        }
    }

    fn handle_set_expr(&mut self, kind: Option<StatementKind>, table: &str, body: &'a SetExpr) {
        match body {
            SetExpr::Select(select) => self.handle_select(kind, table, select),
            SetExpr::Query(query) => self.push(kind, table.to_string(), Node::Query(query)),
            SetExpr::SetOperation { left, right, .. } => {
                self.push(kind, table.to_string(), Node::SetExpr(left));
                self.push(kind, table.to_string(), Node::SetExpr(right));
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.push(Some(StatementKind::Select), String::new(), Node::Expr(expr));
                    }
                }
            }
            SetExpr::Insert(stmt) | SetExpr::Update(stmt) => {
                self.push(kind, table.to_string(), Node::Statement(stmt));
            }
            _ => {}
        }
    }

    fn handle_select(&mut self, kind: Option<StatementKind>, table: &str, select: &'a Select) {
        let mut current_table = String::new();
        for twj in &select.from {
            self.handle_from_entry(kind, table, twj, &mut current_table);
        }
        self.handle_projection(StatementKind::Select, &current_table, &select.projection);
        if let Some(selection) = &select.selection {
            self.push(
                Some(StatementKind::Select),
                current_table.clone(),
                Node::Expr(selection),
            );
        }
        if let Some(having) = &select.having {
            self.push(
                Some(StatementKind::Select),
                current_table.clone(),
                Node::Expr(having),
            );
        }
    }

    /// Walk one FROM entry: register relation aliases, descend into derived
    /// tables, and submit every join qualification as a Join state carrying
    /// the surrounding statement's table context.
    fn handle_from_entry(
        &mut self,
        kind: Option<StatementKind>,
        table: &str,
        twj: &'a TableWithJoins,
        current_table: &mut String,
    ) {
        self.handle_table_factor(kind, table, &twj.relation, current_table);
        for join in &twj.joins {
            self.handle_table_factor(kind, table, &join.relation, current_table);
            if let Some(on) = join_on_expr(&join.join_operator) {
                self.push(Some(StatementKind::Join), table.to_string(), Node::Expr(on));
            }
        }
    }

    fn handle_table_factor(
        &mut self,
        kind: Option<StatementKind>,
        table: &str,
        factor: &'a TableFactor,
        current_table: &mut String,
    ) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let relname = object_name_tail(name);
                match alias {
                    Some(alias) => {
                        self.table_aliases
                            .insert(alias.name.value.clone(), relname.clone());
                    }
                    None => {
                        self.table_aliases.insert(relname.clone(), relname.clone());
                    }
                }
                if current_table.is_empty() {
                    *current_table = relname;
                }
            }
            // Derived-table aliases deliberately stay unregistered: columns
            // qualified through them resolve inside the subquery instead.
            TableFactor::Derived { subquery, .. } => {
                self.push(kind, table.to_string(), Node::Query(subquery));
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.handle_from_entry(kind, table, table_with_joins, current_table);
            }
            _ => {}
        }
    }

    fn handle_projection(
        &mut self,
        kind: StatementKind,
        current_table: &str,
        items: &'a [SelectItem],
    ) {
        for item in items {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.push(Some(kind), current_table.to_string(), Node::Expr(expr));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.column_aliases.insert(alias.value.clone());
                    self.push(Some(kind), current_table.to_string(), Node::Expr(expr));
                }
                SelectItem::Wildcard(_) => {
                    self.emit(kind, current_table.to_string(), String::new(), true, false);
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let alias = name
                        .0
                        .first()
                        .map(|ident| ident.value.clone())
                        .unwrap_or_default();
                    let table = self.table_aliases.get(&alias).cloned().unwrap_or_default();
                    self.emit(kind, table, String::new(), false, true);
                }
            }
        }
    }

    fn handle_insert(&mut self, kind: Option<StatementKind>, table: &str, insert: &'a Insert) {
        let relname = object_name_tail(&insert.table_name);
        self.table_aliases.insert(relname.clone(), relname.clone());

        if let Some(source) = &insert.source {
            self.push(kind, table.to_string(), Node::Query(source));
        }
        for column in &insert.columns {
            self.push(
                Some(StatementKind::Insert),
                relname.clone(),
                Node::Column(column.value.clone()),
            );
        }
        if let Some(returning) = &insert.returning {
            self.handle_projection(StatementKind::Select, &relname, returning);
        }
        if let Some(OnInsert::OnConflict(on_conflict)) = &insert.on {
            if let OnConflictAction::DoUpdate(do_update) = &on_conflict.action {
                for assignment in &do_update.assignments {
                    self.handle_assignment(&relname, assignment);
                }
                if let Some(selection) = &do_update.selection {
                    self.push(
                        Some(StatementKind::Select),
                        relname.clone(),
                        Node::Expr(selection),
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_update(
        &mut self,
        kind: Option<StatementKind>,
        table: &str,
        target: &'a TableWithJoins,
        assignments: &'a [Assignment],
        from: &'a Option<TableWithJoins>,
        selection: &'a Option<Expr>,
        returning: &'a Option<Vec<SelectItem>>,
    ) {
        let relname = self.register_relation(&target.relation);
        if let Some(from) = from {
            let mut unused = String::new();
            self.handle_from_entry(kind, table, from, &mut unused);
        }
        for assignment in assignments {
            self.handle_assignment(&relname, assignment);
        }
        if let Some(selection) = selection {
            self.push(
                Some(StatementKind::Select),
                relname.clone(),
                Node::Expr(selection),
            );
        }
        if let Some(returning) = returning {
            self.handle_projection(StatementKind::Select, &relname, returning);
        }
    }

    fn handle_delete(&mut self, delete: &'a Delete) {
        let tables = match &delete.from {
            FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
        };
        let relname = tables
            .first()
            .map(|twj| self.register_relation(&twj.relation))
            .unwrap_or_default();

        match &delete.selection {
            Some(selection) => self.push(
                Some(StatementKind::Delete),
                relname.clone(),
                Node::Expr(selection),
            ),
            // No WHERE clause: the whole table is affected.
            None => self.emit(
                StatementKind::Delete,
                relname.clone(),
                String::new(),
                true,
                false,
            ),
        }
        if let Some(using) = &delete.using {
            for twj in using {
                if let TableFactor::Derived { subquery, .. } = &twj.relation {
                    self.push(
                        Some(StatementKind::Select),
                        relname.clone(),
                        Node::Query(subquery),
                    );
                }
            }
        }
        if let Some(returning) = &delete.returning {
            self.handle_projection(StatementKind::Select, &relname, returning);
        }
    }

    /// Register an UPDATE/DELETE/INSERT target relation and return its name.
    fn register_relation(&mut self, factor: &TableFactor) -> String {
        if let TableFactor::Table { name, alias, .. } = factor {
            let relname = object_name_tail(name);
            match alias {
                Some(alias) => {
                    self.table_aliases
                        .insert(alias.name.value.clone(), relname.clone());
                }
                None => {
                    self.table_aliases.insert(relname.clone(), relname.clone());
                }
            }
            relname
        } else {
            String::new()
        }
    }

    fn handle_assignment(&mut self, table: &str, assignment: &'a Assignment) {
        match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                self.push(
                    Some(StatementKind::Update),
                    table.to_string(),
                    Node::Column(object_name_tail(name)),
                );
            }
            AssignmentTarget::Tuple(names) => {
                for name in names {
                    self.push(
                        Some(StatementKind::Update),
                        table.to_string(),
                        Node::Column(object_name_tail(name)),
                    );
                }
            }
        }
        self.push(
            Some(StatementKind::Update),
            table.to_string(),
            Node::Expr(&assignment.value),
        );
    }

    fn handle_expr(&mut self, kind: Option<StatementKind>, table: &str, expr: &'a Expr) {
        match expr {
            Expr::Identifier(ident) => {
                if let Some(kind) = kind {
                    self.emit(kind, table.to_string(), ident.value.clone(), true, false);
                }
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(kind) = kind {
                    let alias = parts
                        .first()
                        .map(|ident| ident.value.clone())
                        .unwrap_or_default();
                    let resolved = self.table_aliases.get(&alias).cloned().unwrap_or_default();
                    let column = parts
                        .get(1)
                        .map(|ident| ident.value.clone())
                        .unwrap_or_default();
                    self.emit(kind, resolved, column, false, true);
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                self.push(kind, table.to_string(), Node::Expr(left));
                self.push(kind, table.to_string(), Node::Expr(right));
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::Cast { expr, .. }
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotFalse(expr) => {
                self.push(kind, table.to_string(), Node::Expr(expr));
            }
            Expr::InList { expr, list, .. } => {
                self.push(kind, table.to_string(), Node::Expr(expr));
                for item in list {
                    self.push(kind, table.to_string(), Node::Expr(item));
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.push(kind, table.to_string(), Node::Expr(expr));
                self.push(kind, table.to_string(), Node::Query(subquery));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.push(kind, table.to_string(), Node::Expr(expr));
                self.push(kind, table.to_string(), Node::Expr(low));
                self.push(kind, table.to_string(), Node::Expr(high));
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.push(kind, table.to_string(), Node::Expr(expr));
                self.push(kind, table.to_string(), Node::Expr(pattern));
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
                ..
            } => {
                if let Some(operand) = operand {
                    self.push(
                        Some(StatementKind::Select),
                        table.to_string(),
                        Node::Expr(operand),
                    );
                }
                for condition in conditions {
                    self.push(
                        Some(StatementKind::Select),
                        table.to_string(),
                        Node::Expr(condition),
                    );
                }
                for result in results {
                    self.push(
                        Some(StatementKind::Select),
                        table.to_string(),
                        Node::Expr(result),
                    );
                }
                if let Some(else_result) = else_result {
                    self.push(
                        Some(StatementKind::Select),
                        table.to_string(),
                        Node::Expr(else_result),
                    );
                }
            }
            Expr::Function(function) => self.handle_function(kind, table, function),
            Expr::Subquery(query) => self.push(kind, table.to_string(), Node::Query(query)),
            Expr::Exists { subquery, .. } => {
                self.push(kind, table.to_string(), Node::Query(subquery));
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.push(kind, table.to_string(), Node::Expr(item));
                }
            }
            _ => {}
        }
    }

    fn handle_function(&mut self, kind: Option<StatementKind>, table: &str, function: &'a Function) {
        match &function.args {
            FunctionArguments::List(list) => {
                for arg in &list.args {
                    let expr = match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
                        FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(expr),
                            ..
                        } => Some(expr),
                        _ => None,
                    };
                    if let Some(expr) = expr {
                        self.push(kind, table.to_string(), Node::Expr(expr));
                    }
                }
            }
            FunctionArguments::Subquery(query) => {
                self.push(kind, table.to_string(), Node::Query(query));
            }
            FunctionArguments::None => {}
        }
        if let Some(WindowType::WindowSpec(spec)) = &function.over {
            for expr in &spec.partition_by {
                self.push(kind, table.to_string(), Node::Expr(expr));
            }
        }
    }
}

fn join_on_expr(operator: &JoinOperator) -> Option<&Expr> {
    let constraint = match operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => constraint,
        _ => return None,
    };
    match constraint {
        JoinConstraint::On(expr) => Some(expr),
        _ => None,
    }
}

fn object_name_tail(name: &sqlparser::ast::ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::StatementKind::{Delete, Insert, Join, Select, Update};
    use super::*;

    fn ops(query: &str) -> HashSet<QueryStatement> {
        extract_query_statements(query)
            .expect("extract")
            .into_iter()
            .collect()
    }

    fn expect(items: &[(StatementKind, &str, &str)]) -> HashSet<QueryStatement> {
        items
            .iter()
            .map(|(kind, table, column)| QueryStatement::new(*kind, *table, *column))
            .collect()
    }

    #[test]
    fn select_all() {
        assert_eq!(
            ops("select * from table1;"),
            expect(&[(Select, "table1", "")])
        );
    }

    #[test]
    fn delete_all() {
        assert_eq!(
            ops("delete from table1;"),
            expect(&[(Delete, "table1", "")])
        );
    }

    #[test]
    fn simple_alias() {
        assert_eq!(
            ops("select tt.a, tt.b from table1 as tt;"),
            expect(&[(Select, "table1", "a"), (Select, "table1", "b")])
        );
    }

    #[test]
    fn subquery() {
        assert_eq!(
            ops("select tt.a, tt.b from (select a, b from table1) as tt;"),
            expect(&[(Select, "table1", "a"), (Select, "table1", "b")])
        );
        assert_eq!(
            ops("select tt.a, tt.b from (select tt.a, tt.b from table1 as tt) as tt;"),
            expect(&[(Select, "table1", "a"), (Select, "table1", "b")])
        );
        assert_eq!(
            ops("select tt.a, table2.c from (select tt.a, tt.b from table1 as tt) as tt, table2;"),
            expect(&[
                (Select, "table1", "a"),
                (Select, "table1", "b"),
                (Select, "table2", "c"),
            ])
        );
        assert_eq!(
            ops("select tt.a, c from (select tt.a, tt.b from table1 as tt) as tt, table2;"),
            expect(&[
                (Select, "table1", "a"),
                (Select, "table1", "b"),
                (Select, "table2", "c"),
            ])
        );
    }

    #[test]
    fn subquery_complicated() {
        let query = r#"SELECT
    u.user_id,
    u.name,
    (
        SELECT json_agg(o)
        FROM (
            SELECT
                o.order_id,
                o.order_date,
                (
                    SELECT string_agg(p.product_name, ', ')
                    FROM order_items oi
                    WHERE oi.order_id = o.order_id
                ) AS product_list
            FROM
                orders o
            WHERE
                o.user_id = u.user_id
                AND o.order_date >= CURRENT_DATE - INTERVAL '1 year'
        ) o
    ) AS orders_last_year
FROM
    users u
WHERE
    (
        SELECT COUNT(*)
        FROM orders o
        WHERE o.user_id = u.user_id
        AND o.order_date >= CURRENT_DATE - INTERVAL '1 month'
    ) > 0;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "orders", "order_id"),
                (Select, "orders", "order_date"),
                (Select, "orders", "user_id"),
                (Select, "order_items", "order_id"),
                (Select, "users", "user_id"),
                (Select, "users", "name"),
            ])
        );
    }

    #[test]
    fn join() {
        assert_eq!(
            ops("select a from table1 inner join table2 on b = a"),
            expect(&[
                (Select, "table1", "a"),
                (Join, "", "a"),
                (Join, "", "b"),
            ])
        );
        assert_eq!(
            ops("select table1.a from table1 inner join table2 on table2.b = table1.a"),
            expect(&[
                (Select, "table1", "a"),
                (Join, "table1", "a"),
                (Join, "table2", "b"),
            ])
        );
    }

    #[test]
    fn join_complicated() {
        let query = r#"SELECT
    c.id AS customer_id,
    c.name AS customer_name,
    c.email AS customer_email
FROM
    customers c
    INNER JOIN orders o ON c.id = o.customer_id
    LEFT JOIN payments p ON o.id = p.order_id
    INNER JOIN order_items oi ON o.id = oi.order_id
    INNER JOIN products prod ON oi.product_id = prod.id
WHERE
    o.order_date BETWEEN '2023-01-01' AND '2023-12-31'
    AND c.email LIKE '%@example.com%'
ORDER BY
    o.order_date DESC,
    c.name ASC;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "customers", "id"),
                (Select, "customers", "name"),
                (Select, "customers", "email"),
                (Select, "orders", "order_date"),
                (Join, "customers", "id"),
                (Join, "orders", "customer_id"),
                (Join, "orders", "id"),
                (Join, "payments", "order_id"),
                (Join, "order_items", "order_id"),
                (Join, "order_items", "product_id"),
                (Join, "products", "id"),
            ])
        );
    }

    #[test]
    fn join_with_subquery() {
        let query = r#"SELECT
    c.name AS customer_name,
    total_orders.total_order_count,
    total_orders.total_order_amount
FROM
    customers c
INNER JOIN (
    SELECT
        o.customer_id,
        COUNT(o.id) AS total_order_count,
        SUM(o.total_amount) AS total_order_amount
    FROM
        orders o
    GROUP BY
        o.customer_id
) AS total_orders ON c.id = total_orders.customer_id
WHERE
    total_orders.total_order_amount > 1000
ORDER BY
    total_orders.total_order_amount DESC;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "customers", "name"),
                (Select, "orders", "customer_id"),
                (Select, "orders", "total_amount"),
                (Select, "orders", "id"),
                (Join, "customers", "id"),
            ])
        );

        let query = r#"SELECT
    cat.name AS category_name,
    sales_summary.total_sales_count,
    sales_summary.total_sales_amount
FROM
    categories cat
INNER JOIN (
    SELECT
        p.category_id,
        COUNT(s.id) AS total_sales_count,
        SUM(s.amount) AS total_sales_amount
    FROM
        sales s
    INNER JOIN products p ON s.product_id = p.id
    GROUP BY
        p.category_id
) AS sales_summary ON cat.id = sales_summary.category_id
WHERE
    sales_summary.total_sales_amount > 5000
ORDER BY
    sales_summary.total_sales_amount DESC;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "categories", "name"),
                (Select, "products", "category_id"),
                (Select, "sales", "id"),
                (Select, "sales", "amount"),
                (Join, "products", "id"),
                (Join, "sales", "product_id"),
                (Join, "categories", "id"),
            ])
        );
    }

    #[test]
    fn update() {
        assert_eq!(
            ops("update table1 set a = 1, b = 2;"),
            expect(&[(Update, "table1", "a"), (Update, "table1", "b")])
        );
    }

    #[test]
    fn update_with_subselect() {
        let query = "update table1 set a = (select max((select min(c) from table3 \
                     where table3.c = table2.d)) from table2), b = a;";
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "table2", "d"),
                (Select, "table3", "c"),
                (Update, "table1", "a"),
                (Update, "table1", "b"),
            ])
        );
    }

    #[test]
    fn update_with_subquery_complicated() {
        let query = r#"UPDATE customers
SET discount_rate =
   CASE
       WHEN total_spent > 10000 THEN 0.20
       WHEN total_spent > 5000 THEN 0.10
       ELSE discount_rate
   END
FROM (
   SELECT
       o.customer_id,
       SUM(o.total_amount) AS total_spent
   FROM
       orders o
   WHERE
       o.order_date >= (CURRENT_DATE - INTERVAL '1 year')
   GROUP BY
       o.customer_id
) AS spending
WHERE
   customers.id = spending.customer_id;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "customers", "discount_rate"),
                (Select, "orders", "customer_id"),
                (Select, "orders", "total_amount"),
                (Select, "orders", "order_date"),
                (Select, "customers", "id"),
                (Update, "customers", "discount_rate"),
            ])
        );
    }

    #[test]
    fn delete() {
        assert_eq!(
            ops("delete from table1 where a = 1;"),
            expect(&[(Delete, "table1", "a")])
        );
        assert_eq!(
            ops("delete from table1 where a = (select max(b) from table2);"),
            expect(&[(Delete, "table1", "a"), (Select, "table2", "b")])
        );
    }

    #[test]
    fn delete_select_update_complicated() {
        let query = r#"DELETE FROM customers
USING (
    SELECT c.id
    FROM customers c
    LEFT JOIN orders o ON c.id = o.customer_id AND o.order_date >= (CURRENT_DATE - INTERVAL '1 year')
    WHERE c.active = FALSE AND o.id IS NULL
) AS inactive_customers
WHERE customers.id = inactive_customers.id;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "customers", "active"),
                (Select, "customers", "id"),
                (Select, "orders", "id"),
                (Join, "customers", "id"),
                (Join, "orders", "customer_id"),
                (Join, "orders", "order_date"),
                (Delete, "customers", "id"),
            ])
        );
    }

    #[test]
    fn update_with_having() {
        let query = r#"UPDATE customers
SET account_balance = 0
FROM (
    SELECT c.id
    FROM customers c
    INNER JOIN orders o ON c.id = o.customer_id
    WHERE o.order_date >= (CURRENT_DATE - INTERVAL '1 year')
    GROUP BY c.id
    HAVING SUM(o.total_amount) < -1000
) AS excessive_returns
WHERE customers.id = excessive_returns.id;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "customers", "id"),
                (Select, "orders", "total_amount"),
                (Select, "orders", "order_date"),
                (Join, "orders", "customer_id"),
                (Join, "customers", "id"),
                (Update, "customers", "account_balance"),
            ])
        );
    }

    #[test]
    fn insert() {
        let query = "insert into table1 (a, b) values ((select max(c) from table1), \
                     (select min(c) from table2)) \
                     on conflict do update set a = (select 1), b = (select min(c) from table2);";
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "table1", "c"),
                (Select, "table2", "c"),
                (Update, "table1", "a"),
                (Update, "table1", "b"),
                (Insert, "table1", "a"),
                (Insert, "table1", "b"),
            ])
        );
    }

    #[test]
    fn cte() {
        let query = r#"
WITH DepartmentSalaries AS (
    SELECT e.employee_id, e.salary, d.department_name
    FROM employees e
    JOIN departments d ON e.department_id = d.department_id
    WHERE d.department_name = 'Engineering'
)
UPDATE employees
SET salary = salary * 1.1
WHERE employee_id IN (SELECT employee_id FROM DepartmentSalaries);"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "salary"),
                (Select, "employees", "employee_id"),
                (Select, "departments", "department_name"),
                (Join, "employees", "department_id"),
                (Join, "departments", "department_id"),
                (Update, "employees", "salary"),
            ])
        );
    }

    #[test]
    fn nested_subqueries() {
        let query = r#"
SELECT e.employee_id, e.salary
FROM employees e
WHERE e.salary > (
    SELECT AVG(salary)
    FROM employees
    WHERE department_id = e.department_id
);"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "salary"),
                (Select, "employees", "department_id"),
            ])
        );
    }

    #[test]
    fn multiple_joins() {
        let query = r#"
SELECT e.employee_id, e.first_name, d.department_name, l.city
FROM employees e
JOIN departments d ON e.department_id = d.department_id
JOIN locations l ON d.location_id = l.location_id
WHERE l.country_id = 'US';"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "first_name"),
                (Select, "departments", "department_name"),
                (Select, "locations", "city"),
                (Join, "employees", "department_id"),
                (Join, "departments", "department_id"),
                (Join, "departments", "location_id"),
                (Join, "locations", "location_id"),
                (Select, "locations", "country_id"),
            ])
        );
    }

    #[test]
    fn complex_cte() {
        let query = r#"
WITH SalaryIncrease AS (
    SELECT employee_id, salary * 1.1 AS new_salary
    FROM employees
    WHERE department_id IN (
        SELECT department_id
        FROM departments
        WHERE location_id = 1700
    )
)
UPDATE employees
SET salary = (SELECT new_salary FROM SalaryIncrease WHERE employee_id = employees.employee_id)
WHERE employee_id IN (SELECT employee_id FROM SalaryIncrease);"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "salary"),
                (Select, "employees", "department_id"),
                (Select, "departments", "department_id"),
                (Select, "departments", "location_id"),
                (Update, "employees", "salary"),
            ])
        );
    }

    #[test]
    fn group_by_having() {
        let query = r#"
SELECT d.department_name, AVG(e.salary) AS avg_salary
FROM employees e
JOIN departments d ON e.department_id = d.department_id
GROUP BY d.department_name
HAVING AVG(e.salary) > 50000;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "departments", "department_name"),
                (Select, "employees", "salary"),
                (Join, "employees", "department_id"),
                (Join, "departments", "department_id"),
            ])
        );
    }

    #[test]
    fn window_functions() {
        let query = r#"
SELECT employee_id, salary,
       RANK() OVER (PARTITION BY department_id ORDER BY salary DESC) as rank
FROM employees;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "salary"),
                (Select, "employees", "department_id"),
            ])
        );
    }

    #[test]
    fn complex_union() {
        let query = r#"
SELECT employee_id, first_name
FROM employees
WHERE salary > 50000
UNION
SELECT employee_id, first_name
FROM managers
WHERE salary > 100000;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "first_name"),
                (Select, "employees", "salary"),
                (Select, "managers", "employee_id"),
                (Select, "managers", "first_name"),
                (Select, "managers", "salary"),
            ])
        );
    }

    #[test]
    fn delete_with_subquery() {
        let query = r#"
DELETE FROM employees
WHERE department_id = (
    SELECT department_id
    FROM departments
    WHERE department_name = 'Sales'
);"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Delete, "employees", "department_id"),
                (Select, "departments", "department_id"),
                (Select, "departments", "department_name"),
            ])
        );
    }

    #[test]
    fn insert_select() {
        let query = r#"
INSERT INTO high_salary_employees (employee_id, salary)
SELECT employee_id, salary
FROM employees
WHERE salary > 100000;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Insert, "high_salary_employees", "employee_id"),
                (Insert, "high_salary_employees", "salary"),
                (Select, "employees", "employee_id"),
                (Select, "employees", "salary"),
            ])
        );
    }

    #[test]
    fn aggregate_functions() {
        let query = r#"
SELECT department_id, COUNT(*) as num_employees, MAX(salary) as max_salary
FROM employees
GROUP BY department_id;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "department_id"),
                (Select, "employees", "salary"),
            ])
        );
    }

    #[test]
    fn recursive_cte() {
        let query = r#"
WITH RECURSIVE EmployeeHierarchy AS (
    SELECT employee_id, manager_id, first_name
    FROM employees
    WHERE manager_id IS NULL
    UNION ALL
    SELECT e.employee_id, e.manager_id, e.first_name
    FROM employees e
    INNER JOIN EmployeeHierarchy eh ON e.manager_id = eh.employee_id
)
SELECT employee_id, first_name
FROM EmployeeHierarchy;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "manager_id"),
                (Select, "employees", "first_name"),
                (Join, "employees", "manager_id"),
            ])
        );
    }

    #[test]
    fn full_outer_join() {
        let query = r#"
SELECT e.employee_id, e.first_name, d.department_name
FROM employees e
FULL OUTER JOIN departments d ON e.department_id = d.department_id;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "first_name"),
                (Select, "departments", "department_name"),
                (Join, "employees", "department_id"),
                (Join, "departments", "department_id"),
            ])
        );
    }

    #[test]
    fn cross_join() {
        let query = r#"
SELECT e.first_name, p.project_name
FROM employees e
CROSS JOIN projects p;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "first_name"),
                (Select, "projects", "project_name"),
            ])
        );
    }

    #[test]
    fn case_statement() {
        let query = r#"
SELECT employee_id,
       CASE
           WHEN salary < 40000 THEN 'Low'
           WHEN salary BETWEEN 40000 AND 80000 THEN 'Medium'
           ELSE 'High'
       END as salary_range
FROM employees;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "salary"),
            ])
        );
    }

    #[test]
    fn lateral_join() {
        let query = r#"
SELECT e.first_name, e.last_name, j.recent_job
FROM employees e
LEFT JOIN LATERAL (
    SELECT job_id AS recent_job
    FROM jobs
    WHERE employee_id = e.employee_id
    ORDER BY start_date DESC
    LIMIT 1
) j ON true;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "first_name"),
                (Select, "employees", "last_name"),
                (Select, "employees", "employee_id"),
                (Select, "jobs", "job_id"),
                (Select, "jobs", "employee_id"),
            ])
        );
    }

    #[test]
    fn super_complex_query() {
        let query = r#"
WITH RECURSIVE EmployeeHierarchy AS (
    SELECT e.employee_id, e.manager_id, e.first_name, e.department_id, 1 AS depth
    FROM employees e
    WHERE e.manager_id IS NULL
    UNION ALL
    SELECT e.employee_id, e.manager_id, e.first_name, e.department_id, eh.depth + 1
    FROM employees e
    INNER JOIN EmployeeHierarchy eh ON e.manager_id = eh.employee_id
),
DepartmentStatistics AS (
    SELECT d.department_id, d.department_name, COUNT(e.employee_id) AS employee_count, AVG(e.salary) AS avg_salary
    FROM departments d
    LEFT JOIN employees e ON d.department_id = e.department_id
    GROUP BY d.department_id, d.department_name
    HAVING COUNT(e.employee_id) > 5
),
RecentHighEarners AS (
    SELECT e.employee_id, e.first_name, e.salary
    FROM employees e
    WHERE e.salary > (SELECT AVG(salary) FROM employees) AND e.hire_date > '2020-01-01'
    ORDER BY e.salary DESC
    LIMIT 10
)
SELECT eh.first_name AS employee_name,
       eh.depth,
       ds.department_name,
       ds.employee_count,
       ds.avg_salary,
       rhe.salary AS recent_high_earner_salary
FROM EmployeeHierarchy eh
JOIN DepartmentStatistics ds ON eh.department_id = ds.department_id
LEFT JOIN RecentHighEarners rhe ON eh.employee_id = rhe.employee_id
ORDER BY eh.depth DESC, ds.avg_salary DESC;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "employee_id"),
                (Select, "employees", "manager_id"),
                (Select, "employees", "first_name"),
                (Select, "employees", "department_id"),
                (Join, "employees", "manager_id"),
                (Select, "departments", "department_id"),
                (Select, "departments", "department_name"),
                (Select, "employees", "salary"),
                (Join, "departments", "department_id"),
                (Join, "employees", "department_id"),
                (Select, "employees", "hire_date"),
            ])
        );
    }

    #[test]
    fn complex_update_from_select() {
        let query = r#"
UPDATE employees
SET salary = salary * 1.05
WHERE department_id IN (
    SELECT department_id
    FROM departments
    WHERE location_id = (
        SELECT location_id
        FROM locations
        WHERE city = 'New York'
    )
);"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Update, "employees", "salary"),
                (Select, "employees", "department_id"),
                (Select, "departments", "department_id"),
                (Select, "departments", "location_id"),
                (Select, "locations", "location_id"),
                (Select, "locations", "city"),
            ])
        );
    }

    #[test]
    fn insert_with_cte_and_having() {
        let query = r#"
WITH HighAvgs AS (
    SELECT department_id, AVG(salary) avg_salary
    FROM employees
    GROUP BY department_id
    HAVING AVG(salary) > 75000
)
INSERT INTO high_salary_departments (department_id, avg_salary)
SELECT department_id, avg_salary
FROM HighAvgs;"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Select, "employees", "department_id"),
                (Select, "employees", "salary"),
                (Insert, "high_salary_departments", "department_id"),
            ])
        );
    }

    #[test]
    fn complex_delete_with_subquery() {
        let query = r#"
DELETE FROM employees
WHERE employee_id IN (
    SELECT employee_id
    FROM employees e
    JOIN projects p ON e.employee_id = p.employee_id
    WHERE p.end_date < '2023-01-01'
    GROUP BY employee_id
    HAVING COUNT(p.project_id) < 2
);"#;
        assert_eq!(
            ops(query),
            expect(&[
                (Delete, "employees", "employee_id"),
                (Select, "employees", "employee_id"),
                (Join, "employees", "employee_id"),
                (Join, "projects", "employee_id"),
                (Select, "projects", "end_date"),
                (Select, "projects", "project_id"),
            ])
        );
    }

    #[test]
    fn extraction_is_stable() {
        let query = "select a, b from table1 inner join table2 on table1.a = table2.b;";
        let first = extract_query_statements(query).expect("extract");
        for _ in 0..5 {
            assert_eq!(first, extract_query_statements(query).expect("extract"));
        }
    }

    #[test]
    fn parse_failure_is_reported() {
        assert!(extract_query_statements("select from from from").is_err());
        assert!(extract_query_statements("definitely not sql ;;;").is_err());
    }

    #[test]
    fn select_always_has_table() {
        let queries = [
            "select a from t1;",
            "select t1.a, b from t1, t2;",
            "select x from (select x from inner1) sub;",
            "update t1 set a = b where c = 1;",
            "insert into t1 (a) select b from t2;",
        ];
        for query in queries {
            for op in extract_query_statements(query).expect("extract") {
                if op.kind == Select {
                    assert!(!op.table.is_empty(), "query {query:?} produced {op:?}");
                }
            }
        }
    }
}
