// Formula analysis utilities
//
// Static walks over a parsed formula. Used by `explain` and diagnostics.
// Invalidation never trusts these: edges come from actual evaluation.

use super::parser::{CompiledExpression, Expr};
use crate::value::Value;

/// Functions whose string argument at the given index names a setting key.
const KEY_ARGUMENTS: &[(&str, usize)] = &[
    ("extruderValue", 1),
    ("extruderValues", 0),
    ("resolveOrValue", 0),
    ("anyExtruderNrWithOrDefault", 0),
];

impl CompiledExpression {
    /// Setting keys this formula may read, in first-seen order: bare
    /// identifiers plus quoted keys handed to cross-stack functions.
    pub fn references(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        walk_expr(self.ast(), &mut |node| {
            let found = match node {
                Expr::Name(name) if !name.contains('.') => Some(name.as_str()),
                Expr::Call { name, args } => KEY_ARGUMENTS
                    .iter()
                    .find(|(function, _)| *function == name.as_str())
                    .and_then(|(_, index)| match args.get(*index) {
                        Some(Expr::Literal(Value::String(key))) => Some(key.as_str()),
                        _ => None,
                    }),
                _ => None,
            };
            if let Some(key) = found {
                if !keys.iter().any(|k| k == key) {
                    keys.push(key.to_string());
                }
            }
        });
        keys
    }

    /// Function names used by this formula, in first-seen order.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        walk_expr(self.ast(), &mut |node| {
            if let Expr::Call { name, .. } = node {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        });
        names
    }

    /// True if the formula is a bare literal (no references, no calls).
    pub fn is_constant(&self) -> bool {
        let mut constant = true;
        walk_expr(self.ast(), &mut |node| {
            if matches!(node, Expr::Name(_) | Expr::Call { .. }) {
                constant = false;
            }
        });
        constant
    }
}

/// Walk the AST depth-first, calling the visitor on every node.
fn walk_expr<F: FnMut(&Expr)>(expr: &Expr, visitor: &mut F) {
    visitor(expr);
    match expr {
        Expr::Literal(_) | Expr::Name(_) => {}
        Expr::List(items) => {
            for item in items {
                walk_expr(item, visitor);
            }
        }
        Expr::Unary { operand, .. } => walk_expr(operand, visitor),
        Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
            walk_expr(left, visitor);
            walk_expr(right, visitor);
        }
        Expr::Compare { first, rest } => {
            walk_expr(first, visitor);
            for (_, operand) in rest {
                walk_expr(operand, visitor);
            }
        }
        Expr::Conditional { condition, then, otherwise } => {
            walk_expr(condition, visitor);
            walk_expr(then, visitor);
            walk_expr(otherwise, visitor);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                walk_expr(arg, visitor);
            }
        }
        Expr::Index { target, index } => {
            walk_expr(target, visitor);
            walk_expr(index, visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::expr::parse;

    #[test]
    fn test_references_include_bare_and_quoted_keys() {
        let expr = parse(
            "max(layer_height, extruderValue(support_extruder_nr, 'wall_thickness')) * math.pi + layer_height",
        )
        .unwrap();
        assert_eq!(
            expr.references(),
            vec!["layer_height", "wall_thickness", "support_extruder_nr"]
        );
    }

    #[test]
    fn test_references_skip_computed_keys() {
        // The key is only known at evaluation time
        let expr = parse("resolveOrValue('infill_' + kind)").unwrap();
        assert_eq!(expr.references(), vec!["kind"]);
    }

    #[test]
    fn test_function_names() {
        let expr = parse("math.ceil(min(a, 2)) + min(b, 3)").unwrap();
        assert_eq!(expr.function_names(), vec!["math.ceil", "min"]);
    }

    #[test]
    fn test_is_constant() {
        assert!(parse("2 * 0.4 + 1").unwrap().is_constant());
        assert!(!parse("line_width * 2").unwrap().is_constant());
        assert!(!parse("defaultExtruderPosition()").unwrap().is_constant());
    }
}
