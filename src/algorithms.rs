//! Hand-built AST fragments for ordered search and team scans
//!
//! These helpers are never translated from kernel source, so their native
//! rendering stays branch-for-branch identical. The translator pulls them
//! into a unit when a kernel calls `lower_bound`, `upper_bound` or
//! `inclusive_scan`.

use crate::cppast::{
    BinaryOp, Block, CType, Expr, FunctionDecl, Init, Method, ParamDecl, Stmt,
};
use crate::dtype::DataType;

/// Kernel-level names of the algorithm built-ins
pub const ALGORITHMS: [&str; 3] = ["lower_bound", "upper_bound", "inclusive_scan"];

pub fn is_algorithm(name: &str) -> bool {
    ALGORITHMS.contains(&name)
}

/// Helper declaration implementing the named algorithm
pub fn helper(name: &str) -> Option<FunctionDecl> {
    match name {
        "lower_bound" => Some(lower_bound()),
        "upper_bound" => Some(upper_bound()),
        "inclusive_scan" => Some(inclusive_scan()),
        _ => None,
    }
}

fn int32() -> CType {
    CType::Scalar(DataType::Int32)
}

fn var(name: &str) -> Expr {
    Expr::decl_ref(name)
}

fn search_params() -> Vec<ParamDecl> {
    vec![
        ParamDecl::new(CType::Generic("ViewType".to_string()), "view"),
        ParamDecl::new(int32(), "size"),
        ParamDecl::new(CType::Generic("ValueType".to_string()), "value"),
    ]
}

/// Smallest `i` in `[0, size]` with `view(i) >= value`
///
/// ```text
/// int32_t left = 0; int32_t right = size; int32_t mid;
/// while (left < right) {
///     mid = left + (right - left) / 2;
///     if (view(mid) < value) { left = mid + 1; } else { right = mid; }
/// }
/// return left;
/// ```
pub fn lower_bound() -> FunctionDecl {
    let mid = Expr::binary(
        BinaryOp::Add,
        var("left"),
        Expr::binary(
            BinaryOp::Div,
            Expr::binary(BinaryOp::Sub, var("right"), var("left")),
            Expr::int(2),
        ),
    );
    let probe = Expr::binary(
        BinaryOp::Lt,
        Expr::view_access("view", vec![var("mid")]),
        var("value"),
    );
    let step = Stmt::if_else(
        probe,
        vec![Stmt::Expr(Expr::assign(
            var("left"),
            Expr::binary(BinaryOp::Add, var("mid"), Expr::int(1)),
        ))],
        vec![Stmt::Expr(Expr::assign(var("right"), var("mid")))],
    );

    FunctionDecl {
        name: "lower_bound".to_string(),
        template_params: vec!["ViewType".to_string(), "ValueType".to_string()],
        return_type: int32(),
        params: search_params(),
        body: Block::new(vec![
            Stmt::decl(int32(), "left", Init::Assign(Expr::int(0))),
            Stmt::decl(int32(), "right", Init::Assign(var("size"))),
            Stmt::decl(int32(), "mid", Init::None),
            Stmt::while_loop(
                Expr::binary(BinaryOp::Lt, var("left"), var("right")),
                vec![Stmt::Expr(Expr::assign(var("mid"), mid)), step],
            ),
            Stmt::Return(Some(var("left"))),
        ]),
    }
}

/// Smallest `i` in `[0, size]` with `view(i) > value`
///
/// ```text
/// int32_t left = -1; int32_t right = size; int32_t mid;
/// while (left + 1 < right) {
///     mid = left + ((right - left) >> 1);
///     if (view(mid) > value) { right = mid; } else { left = mid; }
/// }
/// return right;
/// ```
pub fn upper_bound() -> FunctionDecl {
    let mid = Expr::binary(
        BinaryOp::Add,
        var("left"),
        Expr::binary(
            BinaryOp::Shr,
            Expr::binary(BinaryOp::Sub, var("right"), var("left")),
            Expr::int(1),
        ),
    );
    let probe = Expr::binary(
        BinaryOp::Gt,
        Expr::view_access("view", vec![var("mid")]),
        var("value"),
    );
    let step = Stmt::if_else(
        probe,
        vec![Stmt::Expr(Expr::assign(var("right"), var("mid")))],
        vec![Stmt::Expr(Expr::assign(var("left"), var("mid")))],
    );

    FunctionDecl {
        name: "upper_bound".to_string(),
        template_params: vec!["ViewType".to_string(), "ValueType".to_string()],
        return_type: int32(),
        params: search_params(),
        body: Block::new(vec![
            Stmt::decl(int32(), "left", Init::Assign(Expr::int(-1))),
            Stmt::decl(int32(), "right", Init::Assign(var("size"))),
            Stmt::decl(int32(), "mid", Init::None),
            Stmt::while_loop(
                Expr::binary(
                    BinaryOp::Lt,
                    Expr::binary(BinaryOp::Add, var("left"), Expr::int(1)),
                    var("right"),
                ),
                vec![Stmt::Expr(Expr::assign(var("mid"), mid)), step],
            ),
            Stmt::Return(Some(var("right"))),
        ]),
    }
}

/// Team-wide inclusive prefix sum over the first `size` elements of `view`
/// (`view.extent(0)` when `size < 0`). Rank 0 scans between two barriers.
pub fn inclusive_scan() -> FunctionDecl {
    let barrier = || {
        Stmt::Expr(Expr::method(
            "team_member",
            Method::TeamBarrier,
            vec![],
        ))
    };
    let element = |index: Expr| Expr::view_access("view", vec![index]);

    let scan = vec![
        Stmt::decl(int32(), "n", Init::Assign(var("size"))),
        Stmt::if_else(
            Expr::binary(BinaryOp::Lt, var("n"), Expr::int(0)),
            vec![Stmt::Expr(Expr::assign(
                var("n"),
                Expr::cast(
                    DataType::Int32,
                    Expr::method("view", Method::Extent, vec![Expr::int(0)]),
                ),
            ))],
            vec![],
        ),
        Stmt::For {
            var: "i".to_string(),
            dtype: DataType::Int32,
            begin: Expr::int(1),
            end: var("n"),
            step: 1,
            body: Block::new(vec![Stmt::Expr(Expr::compound_assign(
                BinaryOp::Add,
                element(var("i")),
                element(Expr::binary(BinaryOp::Sub, var("i"), Expr::int(1))),
            ))]),
        },
    ];

    FunctionDecl {
        name: "inclusive_scan".to_string(),
        template_params: vec!["MemberType".to_string(), "ViewType".to_string()],
        return_type: CType::Void,
        params: vec![
            ParamDecl::new(
                CType::Reference(Box::new(CType::Generic("MemberType".to_string()))),
                "team_member",
            ),
            ParamDecl::new(CType::Generic("ViewType".to_string()), "view"),
            ParamDecl::new(int32(), "size"),
        ],
        body: Block::new(vec![
            barrier(),
            Stmt::if_else(
                Expr::binary(
                    BinaryOp::Eq,
                    Expr::method("team_member", Method::TeamRank, vec![]),
                    Expr::int(0),
                ),
                scan,
                vec![],
            ),
            barrier(),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_resolve_by_name() {
        for name in ALGORITHMS {
            let decl = helper(name).unwrap();
            assert_eq!(decl.name, name);
        }
        assert!(helper("sort").is_none());
        assert!(is_algorithm("upper_bound"));
    }

    #[test]
    fn test_search_shapes() {
        let lower = lower_bound();
        assert_eq!(lower.body.stmts.len(), 5);
        assert_eq!(lower.body.stmts[4], Stmt::Return(Some(Expr::decl_ref("left"))));

        let upper = upper_bound();
        assert_eq!(
            upper.body.stmts[0],
            Stmt::decl(int32(), "left", Init::Assign(Expr::int(-1)))
        );
        assert_eq!(upper.body.stmts[4], Stmt::Return(Some(Expr::decl_ref("right"))));
    }
}
