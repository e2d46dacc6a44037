/*!
 * @file context.rs
 * @brief Shared generation context threaded through all rendering
 */

use bson::Bson;
use indexmap::IndexMap;

use crate::config::{TranslateOptions, TranslatorConfig};
use crate::error::{MongoraError, Result};
use crate::expr::Expression;

/// Join binding recorded for a `$lookup`. `consumed` is flipped when a
/// `$size` over the as-field renders a correlated COUNT, telling the
/// pipeline renderer to suppress the JOIN.
#[derive(Debug, Clone)]
pub struct LookupBinding {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub alias: String,
    pub consumed: bool,
}

/// Resolution target for a `$$name` variable.
#[derive(Debug, Clone)]
pub enum VarBinding {
    /// Raw SQL column text (array operator loop variables).
    Column(String),
    /// Outer-scope expression (lookup let-bindings).
    Expr(Expression),
}

/// The single mutable object threaded through rendering. Identifier and
/// bind emission interleave in exactly the order visited; nothing is
/// buffered or reordered.
pub struct GenerationContext<'a> {
    pub config: &'a TranslatorConfig,
    pub options: &'a TranslateOptions,
    sql: String,
    binds: Vec<Bson>,
    bind_counter: usize,
    alias_counter: usize,
    virtual_fields: IndexMap<String, Expression>,
    lookups: IndexMap<String, LookupBinding>,
    unwinds: IndexMap<String, String>,
    variables: IndexMap<String, VarBinding>,
    raw_columns: IndexMap<String, String>,
    column_scopes: Vec<(String, Vec<String>)>,
    base_alias_stack: Vec<String>,
    json_output_depth: u32,
    nested_depth: u32,
    hint_spent: bool,
}

/// Saved registry state, restored when leaving a nested pipeline scope
/// (union branches, facet subqueries) so inner registrations cannot leak
/// into the outer query.
pub struct RegistrySnapshot {
    virtual_fields: IndexMap<String, Expression>,
    lookups: IndexMap<String, LookupBinding>,
    unwinds: IndexMap<String, String>,
    raw_columns: IndexMap<String, String>,
}

impl<'a> GenerationContext<'a> {
    pub fn new(config: &'a TranslatorConfig, options: &'a TranslateOptions) -> Self {
        Self {
            config,
            options,
            sql: String::new(),
            binds: Vec::new(),
            bind_counter: 0,
            alias_counter: 0,
            virtual_fields: IndexMap::new(),
            lookups: IndexMap::new(),
            unwinds: IndexMap::new(),
            variables: IndexMap::new(),
            raw_columns: IndexMap::new(),
            column_scopes: Vec::new(),
            base_alias_stack: Vec::new(),
            json_output_depth: 0,
            nested_depth: 0,
            hint_spent: false,
        }
    }

    /// Optimiser hint text, handed out once for the outermost SELECT.
    pub fn take_hint(&mut self) -> Option<String> {
        if self.hint_spent {
            return None;
        }
        self.hint_spent = true;
        self.options.oracle_hint.clone()
    }

    pub fn snapshot_registries(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            virtual_fields: self.virtual_fields.clone(),
            lookups: self.lookups.clone(),
            unwinds: self.unwinds.clone(),
            raw_columns: self.raw_columns.clone(),
        }
    }

    pub fn restore_registries(&mut self, snapshot: RegistrySnapshot) {
        self.virtual_fields = snapshot.virtual_fields;
        self.lookups = snapshot.lookups;
        self.unwinds = snapshot.unwinds;
        self.raw_columns = snapshot.raw_columns;
    }

    /// Current row-source alias for the document column. Subquery scopes
    /// (graph lookup laterals, bucket-auto wrappers) push an override.
    pub fn base_alias(&self) -> String {
        self.base_alias_stack
            .last()
            .cloned()
            .unwrap_or_else(|| "base".to_string())
    }

    pub fn push_base_alias(&mut self, alias: String) {
        self.base_alias_stack.push(alias);
    }

    pub fn pop_base_alias(&mut self) {
        self.base_alias_stack.pop();
    }

    /// Temporarily steps out of the innermost alias override (used while
    /// rendering let-binding expressions that belong to the outer scope).
    pub fn suspend_base_alias(&mut self) -> Option<String> {
        self.base_alias_stack.pop()
    }

    pub fn restore_base_alias(&mut self, saved: Option<String>) {
        if let Some(alias) = saved {
            self.base_alias_stack.push(alias);
        }
    }

    pub fn data_column(&self) -> &str {
        &self.config.data_column
    }

    pub fn id_column(&self) -> &str {
        &self.config.id_column
    }

    // --- SQL buffer ---

    pub fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    /// Clause separator: a newline in pretty mode, a space otherwise.
    pub fn sep(&mut self) {
        if self.options.pretty {
            self.sql.push('\n');
        } else {
            self.sql.push(' ');
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn finish(self) -> (String, Vec<Bson>) {
        (self.sql, self.binds)
    }

    // --- bind values ---

    /// Emits a value at the current buffer position: booleans and null are
    /// always inline SQL keywords; everything else becomes a `:n`
    /// placeholder, or an inline literal when the caller opted out of
    /// binds.
    pub fn push_value(&mut self, value: Bson) -> Result<()> {
        match value {
            Bson::Boolean(true) => {
                self.push("TRUE");
                Ok(())
            }
            Bson::Boolean(false) => {
                self.push("FALSE");
                Ok(())
            }
            Bson::Null => {
                self.push("NULL");
                Ok(())
            }
            other => {
                if self.options.inline_binds {
                    self.push_inline_literal(&other)
                } else {
                    self.bind_counter += 1;
                    let placeholder = format!(":{}", self.bind_counter);
                    self.push(&placeholder);
                    self.binds.push(other);
                    Ok(())
                }
            }
        }
    }

    /// Inline literal form, used for bucket boundaries and the
    /// inline-binds option. Strings use single-quote doubling.
    pub fn push_inline_literal(&mut self, value: &Bson) -> Result<()> {
        match value {
            Bson::String(s) => {
                let escaped = s.replace('\'', "''");
                self.push(&format!("'{}'", escaped));
            }
            Bson::Int32(i) => self.push(&i.to_string()),
            Bson::Int64(i) => self.push(&i.to_string()),
            Bson::Double(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    self.push(&format!("{:.1}", f));
                } else {
                    self.push(&f.to_string());
                }
            }
            Bson::Boolean(true) => self.push("TRUE"),
            Bson::Boolean(false) => self.push("FALSE"),
            Bson::Null => self.push("NULL"),
            Bson::DateTime(dt) => {
                let iso = dt
                    .try_to_rfc3339_string()
                    .map_err(|e| MongoraError::translation(format!("unrepresentable datetime: {}", e)))?;
                let escaped = iso.replace('\'', "''");
                self.push(&format!(
                    "TO_TIMESTAMP_TZ('{}', 'YYYY-MM-DD\"T\"HH24:MI:SS.FF3TZH:TZM')",
                    escaped
                ));
            }
            Bson::Array(_) | Bson::Document(_) => {
                let json = serde_json::to_string(&value.clone().into_relaxed_extjson())
                    .map_err(|e| MongoraError::translation(format!("unrenderable literal: {}", e)))?;
                let escaped = json.replace('\'', "''");
                self.push(&format!("'{}'", escaped));
            }
            other => {
                return Err(MongoraError::translation(format!(
                    "no inline SQL literal for BSON value of type {:?}",
                    other.element_type()
                )))
            }
        }
        Ok(())
    }

    pub fn bind_count(&self) -> usize {
        self.binds.len()
    }

    // --- alias allocation ---

    pub fn next_alias(&mut self) -> String {
        self.alias_counter += 1;
        format!("t{}", self.alias_counter)
    }

    // --- virtual fields ($addFields) ---

    pub fn register_virtual_field(&mut self, name: String, expr: Expression) {
        self.virtual_fields.insert(name, expr);
    }

    pub fn virtual_field(&self, name: &str) -> Option<Expression> {
        self.virtual_fields.get(name).cloned()
    }

    // --- lookup registry ---

    pub fn register_lookup(&mut self, as_field: String, binding: LookupBinding) {
        self.lookups.insert(as_field, binding);
    }

    pub fn lookup(&self, as_field: &str) -> Option<&LookupBinding> {
        self.lookups.get(as_field)
    }

    /// Longest-prefix match: `customer.tier` resolves against a lookup
    /// registered as `customer`.
    pub fn lookup_for_path(&self, path: &str) -> Option<(&LookupBinding, Option<String>)> {
        if let Some(binding) = self.lookups.get(path) {
            return Some((binding, None));
        }
        for (as_field, binding) in &self.lookups {
            if let Some(rest) = path.strip_prefix(&format!("{}.", as_field)) {
                return Some((binding, Some(rest.to_string())));
            }
        }
        None
    }

    pub fn consume_lookup(&mut self, as_field: &str) -> bool {
        if let Some(binding) = self.lookups.get_mut(as_field) {
            binding.consumed = true;
            true
        } else {
            false
        }
    }

    pub fn lookup_consumed(&self, as_field: &str) -> bool {
        self.lookups.get(as_field).map(|b| b.consumed).unwrap_or(false)
    }

    // --- unwind registry ---

    pub fn register_unwind(&mut self, path: String, alias: String) {
        self.unwinds.insert(path, alias);
    }

    /// Longest registered unwind prefix for a field path, with the path
    /// remainder under the unwound element.
    pub fn unwind_for_path(&self, path: &str) -> Option<(String, Option<String>)> {
        if let Some(alias) = self.unwinds.get(path) {
            return Some((alias.clone(), None));
        }
        let mut best: Option<(usize, String, String)> = None;
        for (unwind_path, alias) in &self.unwinds {
            if let Some(rest) = path.strip_prefix(&format!("{}.", unwind_path)) {
                let len = unwind_path.len();
                if best.as_ref().map(|(l, _, _)| len > *l).unwrap_or(true) {
                    best = Some((len, alias.clone(), rest.to_string()));
                }
            }
        }
        best.map(|(_, alias, rest)| (alias, Some(rest)))
    }

    // --- variables ($$name) ---

    pub fn bind_variable(&mut self, name: String, binding: VarBinding) {
        self.variables.insert(name, binding);
    }

    pub fn unbind_variable(&mut self, name: &str) {
        self.variables.shift_remove(name);
    }

    pub fn variable(&self, name: &str) -> Option<VarBinding> {
        self.variables.get(name).cloned()
    }

    // --- raw column bindings (unwind ordinality fields) ---

    /// Maps a field name directly onto SQL column text, bypassing JSON
    /// access entirely.
    pub fn register_raw_column(&mut self, name: String, sql: String) {
        self.raw_columns.insert(name, sql);
    }

    pub fn raw_column(&self, name: &str) -> Option<String> {
        self.raw_columns.get(name).cloned()
    }

    // --- column scopes (wrapped subqueries) ---

    /// Enters a scope where the named output columns of an inner query are
    /// addressed as `<alias>.<quoted-name>` instead of JSON paths.
    pub fn push_column_scope(&mut self, alias: String, columns: Vec<String>) {
        self.column_scopes.push((alias, columns));
    }

    pub fn pop_column_scope(&mut self) {
        self.column_scopes.pop();
    }

    pub fn resolve_column(&self, name: &str) -> Option<(String, String)> {
        for (alias, columns) in self.column_scopes.iter().rev() {
            if columns.iter().any(|c| c == name) {
                return Some((alias.clone(), name.to_string()));
            }
        }
        None
    }

    // --- mode flags ---

    pub fn enter_json_output(&mut self) {
        self.json_output_depth += 1;
    }

    pub fn exit_json_output(&mut self) {
        debug_assert!(self.json_output_depth > 0);
        self.json_output_depth -= 1;
    }

    pub fn in_json_output(&self) -> bool {
        self.json_output_depth > 0
    }

    /// Scalar subqueries inside a JSON_OBJECT construction compare plain
    /// values; JSON-output access does not apply within them.
    pub fn suspend_json_output(&mut self) -> u32 {
        std::mem::take(&mut self.json_output_depth)
    }

    pub fn restore_json_output(&mut self, depth: u32) {
        self.json_output_depth = depth;
    }

    pub fn enter_nested(&mut self) {
        self.nested_depth += 1;
    }

    pub fn exit_nested(&mut self) {
        debug_assert!(self.nested_depth > 0);
        self.nested_depth -= 1;
    }

    pub fn in_nested(&self) -> bool {
        self.nested_depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TranslateOptions, TranslatorConfig};

    fn context_parts() -> (TranslatorConfig, TranslateOptions) {
        (TranslatorConfig::new("orders"), TranslateOptions::default())
    }

    #[test]
    fn bind_placeholders_are_one_based_and_ordered() {
        let (config, options) = context_parts();
        let mut ctx = GenerationContext::new(&config, &options);
        ctx.push_value(Bson::String("a".into())).unwrap();
        ctx.push(" AND ");
        ctx.push_value(Bson::Int32(5)).unwrap();
        let (sql, binds) = ctx.finish();
        assert_eq!(sql, ":1 AND :2");
        assert_eq!(binds, vec![Bson::String("a".into()), Bson::Int32(5)]);
    }

    #[test]
    fn booleans_and_null_are_inline() {
        let (config, options) = context_parts();
        let mut ctx = GenerationContext::new(&config, &options);
        ctx.push_value(Bson::Boolean(true)).unwrap();
        ctx.push(" ");
        ctx.push_value(Bson::Null).unwrap();
        let (sql, binds) = ctx.finish();
        assert_eq!(sql, "TRUE NULL");
        assert!(binds.is_empty());
    }

    #[test]
    fn inline_literals_double_single_quotes() {
        let (config, options) = context_parts();
        let mut ctx = GenerationContext::new(&config, &options);
        ctx.push_inline_literal(&Bson::String("O'Brien".into())).unwrap();
        assert_eq!(ctx.sql(), "'O''Brien'");
    }

    #[test]
    fn unwind_registry_longest_prefix_wins() {
        let (config, options) = context_parts();
        let mut ctx = GenerationContext::new(&config, &options);
        ctx.register_unwind("items".into(), "u1".into());
        ctx.register_unwind("items.parts".into(), "u2".into());
        let (alias, rest) = ctx.unwind_for_path("items.parts.serial").unwrap();
        assert_eq!(alias, "u2");
        assert_eq!(rest.as_deref(), Some("serial"));
        let (alias, rest) = ctx.unwind_for_path("items.price").unwrap();
        assert_eq!(alias, "u1");
        assert_eq!(rest.as_deref(), Some("price"));
    }

    #[test]
    fn lookup_consumption_round_trip() {
        let (config, options) = context_parts();
        let mut ctx = GenerationContext::new(&config, &options);
        ctx.register_lookup(
            "customer".into(),
            LookupBinding {
                from: "customers".into(),
                local_field: "customerId".into(),
                foreign_field: "email".into(),
                alias: "t1".into(),
                consumed: false,
            },
        );
        assert!(!ctx.lookup_consumed("customer"));
        assert!(ctx.consume_lookup("customer"));
        assert!(ctx.lookup_consumed("customer"));
        let (binding, rest) = ctx.lookup_for_path("customer.tier").unwrap();
        assert_eq!(binding.alias, "t1");
        assert_eq!(rest.as_deref(), Some("tier"));
    }

    #[test]
    fn column_scope_shadows_json_access() {
        let (config, options) = context_parts();
        let mut ctx = GenerationContext::new(&config, &options);
        assert!(ctx.resolve_column("totalAmount").is_none());
        ctx.push_column_scope("inner_query".into(), vec!["totalAmount".into()]);
        let (alias, column) = ctx.resolve_column("totalAmount").unwrap();
        assert_eq!(alias, "inner_query");
        assert_eq!(column, "totalAmount");
        ctx.pop_column_scope();
        assert!(ctx.resolve_column("totalAmount").is_none());
    }
}
