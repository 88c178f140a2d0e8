//! Name-resolution scopes used while building and decoding plans.
//!
//! A [`ScopeContext`] records the WITH aliases, binding variables, and FROM
//! aliases visible at one nesting level and borrows its parent for everything
//! declared further out. Child scopes are created for quantifiers,
//! comprehensions, and sub-queries, so their names never leak outward.

use std::cell::RefCell;
use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::algebra::{FromTerm, JoinCondition, Select, SelectBody, Subselect, WithBinding};
use crate::expr::{AliasKind, Binding, Expr, IdentKind};

/// Names visible at some point of a statement, with what each resolves to.
pub type VisibleNames = BTreeMap<String, IdentKind>;

/// A sub-query expression met while classifying, with the names its
/// enclosing scope made visible.
#[derive(Clone, Debug, PartialEq)]
pub struct ScopedSubquery {
    /// Classified sub-query.
    pub select: Select,
    /// Names the sub-query inherits.
    pub outer: VisibleNames,
}

/// One level of name resolution.
#[derive(Debug, Default)]
pub struct ScopeContext<'p> {
    parent: Option<&'p ScopeContext<'p>>,
    withs: FxHashSet<String>,
    vars: FxHashMap<String, IdentKind>,
    aliases: FxHashMap<String, AliasKind>,
    recorded: Option<RefCell<Vec<ScopedSubquery>>>,
}

impl ScopeContext<'static> {
    /// Empty root scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root scope that remembers every sub-query expression it classifies.
    pub fn recording() -> Self {
        Self {
            recorded: Some(RefCell::default()),
            ..Self::default()
        }
    }

    /// Root scope in which `names` resolve as they did where they were taken.
    pub fn seeded(names: &VisibleNames) -> Self {
        let mut scope = Self::new();
        for (name, kind) in names {
            match kind {
                IdentKind::With => {
                    scope.withs.insert(name.clone());
                }
                IdentKind::Variable { .. } => {
                    scope.vars.insert(name.clone(), *kind);
                }
                IdentKind::Alias(alias) => {
                    scope.aliases.insert(name.clone(), *alias);
                }
                IdentKind::Unresolved => {}
            }
        }
        scope
    }

    /// Sub-queries classified so far under this recording scope.
    pub fn take_recorded(&self) -> Vec<ScopedSubquery> {
        self.recorded
            .as_ref()
            .map(RefCell::take)
            .unwrap_or_default()
    }
}

impl<'p> ScopeContext<'p> {
    /// Nested scope that sees every name visible here.
    pub fn child(&self) -> ScopeContext<'_> {
        ScopeContext {
            parent: Some(self),
            withs: FxHashSet::default(),
            vars: FxHashMap::default(),
            aliases: FxHashMap::default(),
            recorded: None,
        }
    }

    /// Every name visible here, resolved as [`ScopeContext::resolve`] would.
    pub fn visible(&self) -> VisibleNames {
        let mut names = VisibleNames::new();
        let mut current = Some(self);
        while let Some(scope) = current {
            let declared = scope
                .withs
                .iter()
                .chain(scope.vars.keys())
                .chain(scope.aliases.keys());
            for name in declared {
                if !names.contains_key(name) {
                    names.insert(name.clone(), self.resolve(name));
                }
            }
            current = scope.parent;
        }
        names
    }

    fn record(&self, select: &Select) {
        let mut root = self;
        while let Some(parent) = root.parent {
            root = parent;
        }
        if let Some(log) = &root.recorded {
            log.borrow_mut().push(ScopedSubquery {
                select: select.clone(),
                outer: self.visible(),
            });
        }
    }

    /// Registers WITH aliases, classifying each definition first.
    pub fn add_withs(&mut self, withs: &mut [WithBinding]) {
        for with in withs {
            self.map_expr(&mut with.expr);
            self.withs.insert(with.alias.clone());
        }
    }

    /// Registers binding variables in order; each binding expression is
    /// classified before its own variable becomes visible.
    pub fn push_bindings(&mut self, bindings: &mut [Binding]) {
        for binding in bindings {
            self.map_expr(&mut binding.expr);
            binding.static_var = binding.expr.is_static();
            let kind = IdentKind::Variable {
                static_var: binding.static_var,
                func_var: binding.func_var,
            };
            self.vars.insert(binding.variable.clone(), kind);
            if let Some(name) = &binding.name_variable {
                self.vars.insert(name.clone(), kind);
            }
        }
    }

    /// Registers a keyspace alias unless the name is already taken here.
    pub fn add_keyspace_alias(&mut self, alias: &str) {
        self.add_alias(alias, AliasKind::Keyspace);
    }

    /// Registers an UNNEST alias unless the name is already taken here.
    pub fn add_unnest_alias(&mut self, alias: &str) {
        self.add_alias(alias, AliasKind::Unnest);
    }

    /// Registers an expression-term alias unless the name is already taken here.
    pub fn add_expr_term_alias(&mut self, alias: &str) {
        self.add_alias(alias, AliasKind::ExpressionTerm);
    }

    /// Registers a sub-query term alias unless the name is already taken here.
    pub fn add_subquery_term_alias(&mut self, alias: &str) {
        self.add_alias(alias, AliasKind::SubqueryTerm);
    }

    fn add_alias(&mut self, alias: &str, kind: AliasKind) {
        self.aliases.entry(alias.to_string()).or_insert(kind);
    }

    /// True when `name` resolves to a FROM alias at any level.
    pub fn has_alias(&self, name: &str) -> bool {
        matches!(self.resolve(name), IdentKind::Alias(_))
    }

    /// Classifies a name: WITH aliases first, then variables, then FROM aliases.
    pub fn resolve(&self, name: &str) -> IdentKind {
        if self.find_map(|scope| scope.withs.contains(name).then_some(())).is_some() {
            return IdentKind::With;
        }
        if let Some(kind) = self.find_map(|scope| scope.vars.get(name).copied()) {
            return kind;
        }
        if let Some(kind) = self.find_map(|scope| scope.aliases.get(name).copied()) {
            return IdentKind::Alias(kind);
        }
        IdentKind::Unresolved
    }

    fn find_map<T>(&self, f: impl Fn(&ScopeContext<'_>) -> Option<T>) -> Option<T> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(found) = f(scope) {
                return Some(found);
            }
            current = scope.parent;
        }
        None
    }

    /// Classifies every identifier in `expr` against this scope.
    pub fn map_expr(&self, expr: &mut Expr) {
        match expr {
            Expr::Identifier(ident) => ident.kind = self.resolve(&ident.name),
            Expr::Quantified(q) => {
                let mut inner = self.child();
                inner.push_bindings(&mut q.bindings);
                inner.map_expr(&mut q.satisfies);
            }
            Expr::Comprehension(c) => {
                let mut inner = self.child();
                inner.push_bindings(&mut c.bindings);
                inner.map_expr(&mut c.mapping);
                if let Some(when) = &mut c.when {
                    inner.map_expr(when);
                }
            }
            Expr::ObjectComprehension(c) => {
                let mut inner = self.child();
                inner.push_bindings(&mut c.bindings);
                inner.map_expr(&mut c.name_mapping);
                inner.map_expr(&mut c.value_mapping);
                if let Some(when) = &mut c.when {
                    inner.map_expr(when);
                }
            }
            Expr::Subquery(select) => {
                self.map_select(select);
                self.record(select);
            }
            other => other.for_each_child_mut(|child| self.map_expr(child)),
        }
    }

    /// Classifies a whole SELECT in a nested scope.
    pub fn map_select(&self, select: &mut Select) {
        let mut scope = self.child();
        scope.add_withs(&mut select.with);
        scope.map_body(&mut select.body);
        for term in &mut select.order {
            scope.map_expr(&mut term.expr);
        }
        if let Some(offset) = &mut select.offset {
            scope.map_expr(offset);
        }
        if let Some(limit) = &mut select.limit {
            scope.map_expr(limit);
        }
    }

    /// Classifies a query body; each set-operation side gets its own scope.
    pub fn map_body(&mut self, body: &mut SelectBody) {
        match body {
            SelectBody::Subselect(sub) => self.map_subselect(sub),
            SelectBody::SetOp(op) => {
                self.child().map_body(&mut op.first);
                self.child().map_body(&mut op.second);
            }
        }
    }

    /// Registers FROM aliases and classifies every clause of one subselect.
    pub fn map_subselect(&mut self, sub: &mut Subselect) {
        if let Some(from) = &mut sub.from {
            self.map_from(from);
        }
        self.push_bindings(&mut sub.let_);
        if let Some(cond) = &mut sub.where_ {
            self.map_expr(cond);
        }
        if let Some(group) = &mut sub.group {
            for key in &mut group.by {
                self.map_expr(key);
            }
            self.push_bindings(&mut group.letting);
            if let Some(having) = &mut group.having {
                self.map_expr(having);
            }
        }
        for term in &mut sub.projection.terms {
            if let Some(expr) = &mut term.expr {
                self.map_expr(expr);
            }
        }
    }

    /// Registers the aliases introduced by a FROM term, left to right.
    pub fn map_from(&mut self, term: &mut FromTerm) {
        match term {
            FromTerm::Keyspace(ks) => {
                if let Some(keys) = &mut ks.keys {
                    self.map_expr(keys);
                }
                let alias = ks.as_alias().to_string();
                self.add_keyspace_alias(&alias);
            }
            FromTerm::Expression { expr, alias } => {
                self.map_expr(expr);
                self.add_expr_term_alias(alias);
            }
            FromTerm::Subquery { select, alias } => {
                self.map_select(select);
                self.add_subquery_term_alias(alias);
            }
            FromTerm::Join(join) | FromTerm::Nest(join) => {
                self.map_from(&mut join.left);
                if let Some(keys) = &mut join.right.keys {
                    self.map_expr(keys);
                }
                let alias = join.right.as_alias().to_string();
                match &mut join.condition {
                    JoinCondition::OnKeys(keys) => {
                        self.map_expr(keys);
                        self.add_keyspace_alias(&alias);
                    }
                    JoinCondition::On { expr, .. } => {
                        self.add_keyspace_alias(&alias);
                        self.map_expr(expr);
                    }
                }
            }
            FromTerm::Unnest(unnest) => {
                self.map_from(&mut unnest.left);
                self.map_expr(&mut unnest.expr);
                self.add_unnest_alias(&unnest.alias);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use proptest::prelude::*;

    fn kind_of(expr: &Expr, name: &str) -> Option<IdentKind> {
        match expr {
            Expr::Identifier(ident) if ident.name == name => Some(ident.kind),
            _ => expr.children().into_iter().find_map(|c| kind_of(c, name)),
        }
    }

    #[test]
    fn with_aliases_win_over_variables_and_aliases() {
        let mut root = ScopeContext::new();
        let mut withs = vec![WithBinding {
            alias: "x".into(),
            expr: Expr::constant(1),
        }];
        root.add_withs(&mut withs);
        let mut inner = root.child();
        inner.push_bindings(&mut [Binding::new("x", Expr::constant(2))]);
        inner.add_keyspace_alias("x");
        assert_eq!(inner.resolve("x"), IdentKind::With);
    }

    #[test]
    fn first_alias_registration_is_kept() {
        let mut scope = ScopeContext::new();
        scope.add_unnest_alias("u");
        scope.add_keyspace_alias("u");
        assert_eq!(scope.resolve("u"), IdentKind::Alias(AliasKind::Unnest));
        assert_eq!(scope.resolve("nope"), IdentKind::Unresolved);
    }

    #[test]
    fn quantifier_variables_do_not_leak() {
        let mut scope = ScopeContext::new();
        scope.add_keyspace_alias("o");
        let mut expr = parse("(any `i` in (`o`.`items`) satisfies (`i` > 1) end and (`i` = 2))")
            .expect("parse");
        scope.map_expr(&mut expr);
        let Expr::Binary(_, left, right) = &expr else {
            panic!("unexpected shape: {expr:?}");
        };
        match left.as_ref() {
            Expr::Quantified(q) => {
                assert_eq!(
                    kind_of(&q.satisfies, "i"),
                    Some(IdentKind::Variable {
                        static_var: false,
                        func_var: false
                    })
                );
                assert_eq!(
                    kind_of(&q.bindings[0].expr, "o"),
                    Some(IdentKind::Alias(AliasKind::Keyspace))
                );
            }
            other => panic!("unexpected left: {other:?}"),
        }
        assert_eq!(kind_of(right, "i"), Some(IdentKind::Unresolved));
        assert_eq!(scope.resolve("i"), IdentKind::Unresolved);
    }

    #[test]
    fn static_bindings_are_marked() {
        let mut scope = ScopeContext::new();
        let mut bindings = [
            Binding::new("c", Expr::constant(3)),
            Binding::new("d", Expr::ident("c")),
        ];
        scope.push_bindings(&mut bindings);
        assert!(bindings[0].static_var);
        assert_eq!(
            scope.resolve("c"),
            IdentKind::Variable {
                static_var: true,
                func_var: false
            }
        );
        assert!(!bindings[1].static_var);
    }

    #[test]
    fn correlated_subquery_sees_outer_alias() {
        let mut scope = ScopeContext::new();
        scope.add_keyspace_alias("o");
        let mut expr =
            parse("(select raw (`l`.`qty`) from `lines` as `l` use keys (`o`.`line_ids`))")
                .expect("parse");
        scope.map_expr(&mut expr);
        let Expr::Subquery(select) = &expr else {
            panic!("unexpected shape: {expr:?}");
        };
        let SelectBody::Subselect(sub) = &select.body else {
            panic!("unexpected body");
        };
        match &sub.from {
            Some(FromTerm::Keyspace(ks)) => {
                let keys = ks.keys.as_ref().expect("keys");
                assert_eq!(kind_of(keys, "o"), Some(IdentKind::Alias(AliasKind::Keyspace)));
            }
            other => panic!("unexpected from: {other:?}"),
        }
        let term = sub.projection.terms[0].expr.as_ref().expect("raw term");
        assert_eq!(kind_of(term, "l"), Some(IdentKind::Alias(AliasKind::Keyspace)));
        assert!(!scope.has_alias("l"));
    }

    #[test]
    fn recording_scope_keeps_outer_names_of_subqueries() {
        let mut root = ScopeContext::recording();
        root.add_keyspace_alias("o");
        let mut inner = root.child();
        inner.push_bindings(&mut [Binding::new("n", Expr::constant(2))]);
        let mut expr =
            parse("(select raw (`l`.`qty`) from `lines` as `l` use keys (`o`.`line_ids`))")
                .expect("parse");
        inner.map_expr(&mut expr);
        let recorded = root.take_recorded();
        assert_eq!(recorded.len(), 1);
        let outer = &recorded[0].outer;
        assert_eq!(outer.get("o"), Some(&IdentKind::Alias(AliasKind::Keyspace)));
        assert_eq!(
            outer.get("n"),
            Some(&IdentKind::Variable {
                static_var: true,
                func_var: false
            })
        );
        assert!(!outer.contains_key("l"));
        assert!(root.take_recorded().is_empty());
        assert!(ScopeContext::new().take_recorded().is_empty());
    }

    #[test]
    fn seeded_scope_resolves_names_as_recorded() {
        let mut names = VisibleNames::new();
        names.insert("w".into(), IdentKind::With);
        names.insert("u".into(), IdentKind::Alias(AliasKind::Unnest));
        let param = IdentKind::Variable {
            static_var: false,
            func_var: true,
        };
        names.insert("p".into(), param);
        let seeded = ScopeContext::seeded(&names);
        let inner = seeded.child();
        assert_eq!(inner.resolve("w"), IdentKind::With);
        assert_eq!(inner.resolve("u"), IdentKind::Alias(AliasKind::Unnest));
        assert_eq!(inner.resolve("p"), param);
        assert_eq!(inner.visible(), names);
    }

    proptest! {
        #[test]
        fn quantified_names_stay_inside(var in "[a-z]{1,6}", alias in "[a-z]{1,6}") {
            prop_assume!(var != alias);
            let mut scope = ScopeContext::new();
            scope.add_keyspace_alias(&alias);
            let text = format!("any `{var}` in (`{alias}`.`items`) satisfies (`{var}` > `{alias}`) end");
            let mut expr = parse(&text).expect("parse");
            scope.map_expr(&mut expr);
            let Expr::Quantified(q) = &expr else {
                panic!("unexpected shape: {expr:?}");
            };
            let is_var = matches!(kind_of(&q.satisfies, &var), Some(IdentKind::Variable { .. }));
            prop_assert!(is_var);
            prop_assert_eq!(
                kind_of(&q.satisfies, &alias),
                Some(IdentKind::Alias(AliasKind::Keyspace))
            );
            prop_assert_eq!(scope.resolve(&var), IdentKind::Unresolved);
        }
    }
}
