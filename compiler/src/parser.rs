// Parser for Weft .weft source files.
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators; expressions and statements are recursive grammars.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a Weft source string. Lexes then parses.
///
/// Returns an AST (if parsing succeeded) plus any errors.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser();
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

// ── Helpers ──

enum Postfix {
    Index(Expr),
    Field(Ident),
}

enum AppItem {
    Arg(AppArg),
    Redirect(Redirect),
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = join(lhs.span, rhs.span);
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    }
}

/// Prepend `first` to a chain, flattening `a => (b => c)` into one stage list.
fn chain(first: Stmt, next: Stmt, span: Span) -> Stmt {
    let chain = match next.kind {
        StmtKind::Chain(mut inner) => {
            inner.stages.insert(0, first);
            inner
        }
        _ => ChainStmt {
            stages: vec![first],
            last: Box::new(next),
        },
    };
    Stmt {
        kind: StmtKind::Chain(chain),
        span,
    }
}

// ── Main parser builder ──

fn program_parser<'tokens, I>(
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>>
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier / literals ──

    let ident = select! {
        Token::Ident(name) = e => Ident { name, span: e.span() },
    };

    let string = select! {
        Token::StringLit(s) => s,
    };

    // ── Expressions ──

    let expr = recursive(|expr| {
        let literal = select! {
            Token::IntLit(v) = e => Expr { kind: ExprKind::IntLit(v), span: e.span() },
            Token::FloatLit(v) = e => Expr { kind: ExprKind::FloatLit(v), span: e.span() },
            Token::StringLit(s) = e => Expr { kind: ExprKind::StringLit(s), span: e.span() },
            Token::True = e => Expr { kind: ExprKind::BoolLit(true), span: e.span() },
            Token::False = e => Expr { kind: ExprKind::BoolLit(false), span: e.span() },
        };

        let call = ident
            .clone()
            .then(
                expr.clone()
                    .separated_by(just(Token::Comma))
                    .allow_trailing()
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map_with(|(name, args), e| Expr {
                kind: ExprKind::Call { name, args },
                span: e.span(),
            });

        let var = ident.clone().map(|id| Expr {
            kind: ExprKind::Var(id.name),
            span: id.span,
        });

        let array_lit = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map_with(|items, e| Expr {
                kind: ExprKind::ArrayLit(items),
                span: e.span(),
            });

        let paren = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let atom = choice((literal, call, var, array_lit, paren));

        let postfix_op = choice((
            expr.clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .map_with(|ix, e| (Postfix::Index(ix), e.span())),
            just(Token::Dot)
                .ignore_then(ident.clone())
                .map_with(|field, e| (Postfix::Field(field), e.span())),
        ));

        let postfix = atom.foldl(postfix_op.repeated(), |base, (op, span)| {
            let span = join(base.span, span);
            let kind = match op {
                Postfix::Index(index) => ExprKind::Index {
                    base: Box::new(base),
                    index: Box::new(index),
                },
                Postfix::Field(field) => ExprKind::Field {
                    base: Box::new(base),
                    field,
                },
            };
            Expr { kind, span }
        });

        let unary = select! {
            Token::Minus = e => (UnaryOp::Neg, e.span()),
            Token::Bang = e => (UnaryOp::Not, e.span()),
        }
        .repeated()
        .foldr(postfix, |(op, span), operand| Expr {
            span: join(span, operand.span),
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        })
        .boxed();

        let power = unary
            .clone()
            .foldl(
                just(Token::StarStar)
                    .to(BinaryOp::Pow)
                    .then(unary)
                    .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed();

        let product = power
            .clone()
            .foldl(
                choice((
                    just(Token::Star).to(BinaryOp::Mul),
                    just(Token::Slash).to(BinaryOp::Div),
                    just(Token::PercentSlash).to(BinaryOp::IntDiv),
                    just(Token::PercentPercent).to(BinaryOp::Mod),
                ))
                .then(power)
                .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                choice((
                    just(Token::Plus).to(BinaryOp::Add),
                    just(Token::Minus).to(BinaryOp::Sub),
                ))
                .then(product)
                .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed();

        let comparison = sum
            .clone()
            .foldl(
                choice((
                    just(Token::LtEq).to(BinaryOp::Lte),
                    just(Token::GtEq).to(BinaryOp::Gte),
                    just(Token::Lt).to(BinaryOp::Lt),
                    just(Token::Gt).to(BinaryOp::Gt),
                ))
                .then(sum)
                .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed();

        let equality = comparison
            .clone()
            .foldl(
                choice((
                    just(Token::EqEq).to(BinaryOp::Eq),
                    just(Token::NotEq).to(BinaryOp::Neq),
                ))
                .then(comparison)
                .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed();

        let conjunction = equality
            .clone()
            .foldl(
                just(Token::AndAnd)
                    .to(BinaryOp::And)
                    .then(equality)
                    .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed();

        conjunction
            .clone()
            .foldl(
                just(Token::OrOr)
                    .to(BinaryOp::Or)
                    .then(conjunction)
                    .repeated(),
                |l, (op, r)| binary(op, l, r),
            )
            .boxed()
    });

    let paren_expr = expr
        .clone()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let expr_list = expr
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>();

    // ── Annotations: '@' IDENT ('=' value)? ──

    let annotation_value = select! {
        Token::Ident(s) => s,
        Token::StringLit(s) => s,
        Token::IntLit(v) => v.to_string(),
        Token::True => "true".to_string(),
        Token::False => "false".to_string(),
    };

    let annotations = just(Token::At)
        .ignore_then(ident.clone())
        .then(just(Token::Eq).ignore_then(annotation_value).or_not())
        .map_with(|(key, value), e| Annotation {
            key,
            value,
            span: e.span(),
        })
        .repeated()
        .collect::<Vec<_>>();

    // ── Array dimensions: ('[' IDENT? ']')* ──

    let dims = just(Token::LBracket)
        .ignore_then(ident.clone().or_not())
        .then_ignore(just(Token::RBracket))
        .map_with(|key, e| ArrayDim {
            key,
            span: e.span(),
        })
        .repeated()
        .collect::<Vec<_>>();

    // ── Mapping: '<' (string | call | var) '>' ──

    let mapping_expr = choice((
        select! {
            Token::StringLit(s) = e => Expr { kind: ExprKind::StringLit(s), span: e.span() },
        },
        ident
            .clone()
            .then(
                expr.clone()
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map_with(|(name, args), e| Expr {
                kind: ExprKind::Call { name, args },
                span: e.span(),
            }),
        ident.clone().map(|id| Expr {
            kind: ExprKind::Var(id.name),
            span: id.span,
        }),
    ));

    let mapping = just(Token::Lt)
        .ignore_then(mapping_expr)
        .then_ignore(just(Token::Gt));

    // ── Declaration: TYPE declarator (',' declarator)* ──

    let declarator = ident
        .clone()
        .then(dims.clone())
        .then(mapping.or_not())
        .then(just(Token::Eq).ignore_then(expr.clone()).or_not())
        .map_with(|(((name, dims), mapping), init), e| VarDeclarator {
            name,
            dims,
            mapping,
            init,
            span: e.span(),
        });

    let declaration = ident
        .clone()
        .then(
            declarator
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(|(type_name, vars)| Declaration { type_name, vars });

    // ── Statements ──

    let stmt = recursive(|stmt| {
        let block = stmt
            .clone()
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|stmts, e| Block {
                stmts,
                span: e.span(),
            });

        // ── Simple statements (chainable) ──

        let lvalue = ident
            .clone()
            .then(
                choice((
                    just(Token::Dot)
                        .ignore_then(ident.clone())
                        .map(PathStep::Field),
                    expr.clone()
                        .delimited_by(just(Token::LBracket), just(Token::RBracket))
                        .map(PathStep::Index),
                ))
                .repeated()
                .collect::<Vec<_>>(),
            )
            .map_with(|(root, path), e| LValueExpr {
                root,
                path,
                span: e.span(),
            });

        let update = ident
            .clone()
            .then_ignore(just(Token::Lt))
            .then(ident.clone())
            .then_ignore(just(Token::Gt))
            .then_ignore(just(Token::ColonEq))
            .then(expr.clone())
            .map(|((target, mode), value)| {
                StmtKind::Update(UpdateStmt {
                    target,
                    mode,
                    value,
                })
            });

        let assignment = lvalue
            .separated_by(just(Token::Comma))
            .at_least(1)
            .collect::<Vec<_>>()
            .then_ignore(just(Token::Eq))
            .then(expr_list.clone())
            .map(|(targets, values)| StmtKind::Assign(Assignment { targets, values }));

        let simple = choice((
            update,
            declaration.clone().map(StmtKind::Declaration),
            assignment,
            expr.clone().map(StmtKind::Expr),
        ))
        .map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        });

        let simple_or_chain = simple
            .then(choice((
                just(Token::Chain).ignore_then(stmt.clone()).map(Some),
                just(Token::Semi).to(None),
            )))
            .map_with(|(first, next), e| match next {
                None => first,
                Some(next) => chain(first, next, e.span()),
            });

        // ── Compound statements ──

        let if_stmt = just(Token::If)
            .ignore_then(paren_expr.clone())
            .then(block.clone())
            .then(
                just(Token::Else)
                    .ignore_then(block.clone().or(stmt.clone().map(|s: Stmt| Block {
                        span: s.span,
                        stmts: vec![s],
                    })))
                    .or_not(),
            )
            .map(|((cond, then_block), else_block)| {
                StmtKind::If(IfStmt {
                    cond,
                    then_block,
                    else_block,
                })
            });

        let case_label = just(Token::Minus)
            .or_not()
            .then(select! { Token::IntLit(v) => v })
            .map(|(neg, v)| if neg.is_some() { -v } else { v });

        let case = just(Token::Case)
            .ignore_then(case_label)
            .then_ignore(just(Token::Colon))
            .then(stmt.clone().repeated().collect::<Vec<_>>())
            .map_with(|(label, stmts), e| SwitchCase {
                label,
                body: Block {
                    stmts,
                    span: e.span(),
                },
                span: e.span(),
            });

        let default_case = just(Token::Default)
            .ignore_then(just(Token::Colon))
            .ignore_then(stmt.clone().repeated().collect::<Vec<_>>())
            .map_with(|stmts, e| Block {
                stmts,
                span: e.span(),
            });

        let switch_stmt = just(Token::Switch)
            .ignore_then(paren_expr.clone())
            .then(
                case.repeated()
                    .collect::<Vec<_>>()
                    .then(default_case.or_not())
                    .delimited_by(just(Token::LBrace), just(Token::RBrace)),
            )
            .map(|(scrutinee, (cases, default))| {
                StmtKind::Switch(SwitchStmt {
                    scrutinee,
                    cases,
                    default,
                })
            });

        let range = expr
            .clone()
            .then_ignore(just(Token::Colon))
            .then(expr.clone())
            .then(just(Token::Colon).ignore_then(expr.clone()).or_not())
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map(|((start, end), step)| ForeachSource::Range { start, end, step });

        let foreach_stmt = annotations
            .clone()
            .then_ignore(just(Token::Foreach))
            .then(ident.clone())
            .then(just(Token::Comma).ignore_then(ident.clone()).or_not())
            .then_ignore(just(Token::In))
            .then(range.or(expr.clone().map(ForeachSource::Array)))
            .then(block.clone())
            .map(|((((annotations, member), counter), source), body)| {
                StmtKind::Foreach(ForeachStmt {
                    annotations,
                    member,
                    counter,
                    source,
                    body,
                })
            });

        let for_init = ident
            .clone()
            .then(ident.clone().or_not())
            .then_ignore(just(Token::Eq))
            .then(expr.clone())
            .map_with(|((first, second), value), e| match second {
                Some(name) => ForInit {
                    type_name: Some(first),
                    name,
                    value,
                    span: e.span(),
                },
                None => ForInit {
                    type_name: None,
                    name: first,
                    value,
                    span: e.span(),
                },
            });

        let for_update = ident
            .clone()
            .then_ignore(just(Token::Eq))
            .then(expr.clone())
            .map_with(|(name, value), e| ForUpdate {
                name,
                value,
                span: e.span(),
            });

        let for_stmt = annotations
            .clone()
            .then_ignore(just(Token::For))
            .then(
                for_init
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .then_ignore(just(Token::Semi))
                    .then(expr.clone())
                    .then_ignore(just(Token::Semi))
                    .then(
                        for_update
                            .separated_by(just(Token::Comma))
                            .collect::<Vec<_>>(),
                    )
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(block.clone())
            .map(|((annotations, ((init, cond), updates)), body)| {
                StmtKind::For(ForStmt {
                    annotations,
                    init,
                    cond,
                    updates,
                    body,
                })
            });

        let iterate_stmt = just(Token::Iterate)
            .ignore_then(ident.clone())
            .then(block.clone())
            .then_ignore(just(Token::Until))
            .then(paren_expr.clone())
            .then_ignore(just(Token::Semi))
            .map(|((var, body), until)| StmtKind::Iterate(IterateStmt { var, body, until }));

        let wait_stmt = just(Token::Wait)
            .ignore_then(just(Token::Deep).or_not().map(|d| d.is_some()))
            .then(
                expr_list
                    .clone()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(block.clone())
            .map(|((deep, exprs), body)| StmtKind::Wait(WaitStmt { exprs, deep, body }));

        let compound = choice((
            block.map(StmtKind::Block),
            if_stmt,
            switch_stmt,
            foreach_stmt,
            for_stmt,
            iterate_stmt,
            wait_stmt,
        ))
        .map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        });

        compound.or(simple_or_chain).boxed()
    });

    let block = stmt
        .clone()
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|stmts, e| Block {
            stmts,
            span: e.span(),
        });

    // ── Top-level definitions ──

    let import = just(Token::Import)
        .ignore_then(choice((
            string
                .clone()
                .map_with(|s, e| ModulePath::Literal(s, e.span())),
            ident
                .clone()
                .separated_by(just(Token::Dot))
                .at_least(1)
                .collect::<Vec<_>>()
                .map(ModulePath::Dotted),
        )))
        .then_ignore(just(Token::Semi))
        .map(|path| TopLevelKind::Import(ImportDecl { path }));

    let formal_arg = ident
        .clone()
        .then(just(Token::Ellipsis).or_not())
        .then(ident.clone())
        .then(dims.clone())
        .map_with(|(((type_name, varargs), name), dims), e| FormalArg {
            type_name,
            name,
            dims,
            varargs: varargs.is_some(),
            span: e.span(),
        });

    let formals = formal_arg
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let type_params = ident
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::Lt), just(Token::Gt));

    let function = annotations
        .clone()
        .then(formals.clone())
        .then(ident.clone())
        .then(type_params.clone().or_not())
        .then(formals.clone())
        .then(block.clone())
        .map(|(((((annotations, outputs), name), type_params), inputs), body)| {
            TopLevelKind::Function(FunctionDecl {
                annotations,
                name,
                type_params: type_params.unwrap_or_default(),
                outputs,
                inputs,
                body,
            })
        });

    let main_shorthand = annotations
        .clone()
        .then(ident.clone())
        .then(block)
        .map(|((annotations, name), body)| {
            TopLevelKind::Function(FunctionDecl {
                annotations,
                name,
                type_params: Vec::new(),
                outputs: Vec::new(),
                inputs: Vec::new(),
                body,
            })
        });

    let builtin = annotations
        .clone()
        .then(formals.clone())
        .then(ident.clone())
        .then(type_params.or_not())
        .then(formals.clone())
        .then(string.clone())
        .then(string.clone())
        .then(string.clone().or_not())
        .then(
            string
                .clone()
                .map_with(|s, e| (s, e.span()))
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .or_not(),
        )
        .then_ignore(just(Token::Semi))
        .map(
            |((((((((annotations, outputs), name), type_params), inputs), package), version), symbol), inline_template)| {
                TopLevelKind::Builtin(BuiltinDecl {
                    annotations,
                    name,
                    type_params: type_params.unwrap_or_default(),
                    outputs,
                    inputs,
                    package,
                    version,
                    symbol,
                    inline_template,
                })
            },
        );

    let redirect_kind = select! {
        Token::Ident(name) if name == "stdin" => RedirectKind::Stdin,
        Token::Ident(name) if name == "stdout" => RedirectKind::Stdout,
        Token::Ident(name) if name == "stderr" => RedirectKind::Stderr,
    };

    let app_item = choice((
        just(Token::At)
            .ignore_then(redirect_kind)
            .then_ignore(just(Token::Eq))
            .then(expr.clone())
            .map_with(|(kind, target), e| {
                AppItem::Redirect(Redirect {
                    kind,
                    target,
                    span: e.span(),
                })
            }),
        just(Token::At)
            .ignore_then(ident.clone())
            .map(|id| AppItem::Arg(AppArg::Filename(id))),
        expr.clone().map(|e| AppItem::Arg(AppArg::Expr(e))),
    ));

    let app_body = string
        .map_with(|s, e| (s, e.span()))
        .then(app_item.repeated().collect::<Vec<_>>())
        .then_ignore(just(Token::Semi))
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|((command, command_span), items), e| {
            let mut args = Vec::new();
            let mut redirects = Vec::new();
            for item in items {
                match item {
                    AppItem::Arg(arg) => args.push(arg),
                    AppItem::Redirect(r) => redirects.push(r),
                }
            }
            AppBody {
                command,
                command_span,
                args,
                redirects,
                span: e.span(),
            }
        });

    let app = annotations
        .clone()
        .then_ignore(just(Token::App))
        .then(formals.clone())
        .then(ident.clone())
        .then(formals)
        .then(app_body)
        .map(|((((annotations, outputs), name), inputs), body)| {
            TopLevelKind::App(AppDecl {
                annotations,
                name,
                outputs,
                inputs,
                body,
            })
        });

    let struct_field = ident
        .clone()
        .then(ident.clone())
        .then(dims.clone())
        .then_ignore(just(Token::Semi))
        .map_with(|((type_name, name), dims), e| StructFieldDecl {
            type_name,
            name,
            dims,
            span: e.span(),
        });

    let struct_type = just(Token::Type)
        .ignore_then(ident.clone())
        .then(
            struct_field
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map(|(name, fields)| TopLevelKind::StructType(StructTypeDecl { name, fields }));

    let new_type = choice((
        just(Token::Type).to(false),
        just(Token::Typedef).to(true),
    ))
    .then(ident.clone())
    .then(ident.clone())
    .then(dims)
    .then_ignore(just(Token::Semi))
    .map(|(((alias_only, name), base), dims)| {
        TopLevelKind::NewType(NewTypeDecl {
            name,
            base,
            dims,
            alias_only,
        })
    });

    let global_const = just(Token::Global)
        .ignore_then(just(Token::Const))
        .ignore_then(declaration)
        .then_ignore(just(Token::Semi))
        .map(TopLevelKind::GlobalConst);

    let top_level = choice((
        import,
        struct_type,
        new_type,
        global_const,
        app,
        builtin,
        function,
        main_shorthand,
    ))
    .map_with(|kind, e| TopLevel {
        kind,
        span: e.span(),
    });

    top_level
        .repeated()
        .collect::<Vec<_>>()
        .map_with(|items, e| Program {
            items,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.program.expect("expected program")
    }

    fn main_body(source: &str) -> Vec<Stmt> {
        let prog = parse_ok(source);
        let TopLevelKind::Function(f) = &prog.items[0].kind else {
            panic!("expected function, got {:?}", prog.items[0].kind)
        };
        f.body.stmts.clone()
    }

    fn one_stmt(body: &str) -> Stmt {
        let stmts = main_body(&format!("main {{ {} }}", body));
        assert_eq!(stmts.len(), 1, "expected 1 statement, got {:#?}", stmts);
        stmts.into_iter().next().unwrap()
    }

    #[test]
    fn empty_program() {
        let prog = parse_ok("");
        assert!(prog.items.is_empty());
    }

    #[test]
    fn import_forms() {
        let prog = parse_ok("import a.b.c; import \"x/y\";");
        let TopLevelKind::Import(first) = &prog.items[0].kind else {
            panic!()
        };
        let ModulePath::Dotted(parts) = &first.path else {
            panic!()
        };
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let TopLevelKind::Import(second) = &prog.items[1].kind else {
            panic!()
        };
        assert!(matches!(&second.path, ModulePath::Literal(s, _) if s == "x/y"));
    }

    #[test]
    fn composite_function_signature() {
        let prog = parse_ok("(int o, float r[]) f (string s, int... rest) { }");
        let TopLevelKind::Function(f) = &prog.items[0].kind else {
            panic!()
        };
        assert_eq!(f.name.name, "f");
        assert_eq!(f.outputs.len(), 2);
        assert_eq!(f.outputs[1].dims.len(), 1);
        assert!(f.inputs[1].varargs);
    }

    #[test]
    fn builtin_with_template_and_annotations() {
        let prog = parse_ok(
            r#"@pure @dispatch=WORKER (int o) plus <T> (T a, T b) "mathpkg" "1.0" "plus_impl" ["set <<o>> [ expr <<a>> + <<b>> ]"];"#,
        );
        let TopLevelKind::Builtin(b) = &prog.items[0].kind else {
            panic!("expected builtin")
        };
        assert_eq!(b.annotations.len(), 2);
        assert_eq!(b.annotations[1].value.as_deref(), Some("WORKER"));
        assert_eq!(b.type_params[0].name, "T");
        assert_eq!(b.symbol.as_deref(), Some("plus_impl"));
        assert!(b.inline_template.is_some());
    }

    #[test]
    fn app_body_with_filename_and_redirect() {
        let prog = parse_ok(r#"app (file o) cat (file i, int n) { "cat" @i n @stdout=o; }"#);
        let TopLevelKind::App(a) = &prog.items[0].kind else {
            panic!()
        };
        assert_eq!(a.body.command, "cat");
        assert_eq!(a.body.args.len(), 2);
        assert!(matches!(&a.body.args[0], AppArg::Filename(id) if id.name == "i"));
        assert_eq!(a.body.redirects.len(), 1);
        assert_eq!(a.body.redirects[0].kind, RedirectKind::Stdout);
    }

    #[test]
    fn struct_and_new_types() {
        let prog = parse_ok("type pt { int x; float ys[]; } type id string; typedef ids id[];");
        assert!(matches!(&prog.items[0].kind, TopLevelKind::StructType(s) if s.fields.len() == 2));
        assert!(matches!(&prog.items[1].kind, TopLevelKind::NewType(t) if !t.alias_only));
        assert!(matches!(&prog.items[2].kind, TopLevelKind::NewType(t) if t.alias_only && t.dims.len() == 1));
    }

    #[test]
    fn global_const_declaration() {
        let prog = parse_ok("global const int N = 10;");
        let TopLevelKind::GlobalConst(d) = &prog.items[0].kind else {
            panic!()
        };
        assert_eq!(d.type_name.name, "int");
        assert_eq!(d.vars[0].init.as_ref().and_then(|e| e.int_literal()), Some(10));
    }

    #[test]
    fn operator_precedence() {
        let s = one_stmt("x = 1 + 2 * 3;");
        let StmtKind::Assign(a) = &s.kind else { panic!() };
        let ExprKind::Binary { op, rhs, .. } = &a.values[0].kind else {
            panic!()
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn declaration_with_mapping_and_dims() {
        let s = one_stmt(r#"file f<"out.txt">, g[];"#);
        let StmtKind::Declaration(d) = &s.kind else { panic!() };
        assert_eq!(d.vars.len(), 2);
        assert_eq!(
            d.vars[0].mapping.as_ref().and_then(|m| m.string_literal()),
            Some("out.txt")
        );
        assert_eq!(d.vars[1].dims.len(), 1);
    }

    #[test]
    fn lvalue_paths() {
        let s = one_stmt("s.a[i][2] = 5;");
        let StmtKind::Assign(a) = &s.kind else { panic!() };
        let path = &a.targets[0].path;
        assert_eq!(path.len(), 3);
        assert!(matches!(&path[0], PathStep::Field(f) if f.name == "a"));
        assert!(matches!(&path[2], PathStep::Index(e) if e.int_literal() == Some(2)));
    }

    #[test]
    fn multi_assign() {
        let s = one_stmt("a, b = f(x);");
        let StmtKind::Assign(a) = &s.kind else { panic!() };
        assert_eq!(a.targets.len(), 2);
        assert_eq!(a.values.len(), 1);
    }

    #[test]
    fn chain_is_flattened() {
        let s = one_stmt("a = f() => b = g(a) => trace(b);");
        let StmtKind::Chain(c) = &s.kind else { panic!() };
        assert_eq!(c.stages.len(), 2);
        assert!(matches!(c.last.kind, StmtKind::Expr(_)));
    }

    #[test]
    fn if_else_if_chain() {
        let s = one_stmt("if (c) { x = 1; } else if (d) { x = 2; } else { x = 3; }");
        let StmtKind::If(i) = &s.kind else { panic!() };
        let else_block = i.else_block.as_ref().expect("else");
        assert!(matches!(else_block.stmts[0].kind, StmtKind::If(_)));
    }

    #[test]
    fn switch_cases() {
        let s = one_stmt("switch (n) { case 1: x = 1; case -2: x = 2; y = 3; default: x = 0; }");
        let StmtKind::Switch(sw) = &s.kind else { panic!() };
        let labels: Vec<i64> = sw.cases.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec![1, -2]);
        assert_eq!(sw.cases[1].body.stmts.len(), 2);
        assert!(sw.default.is_some());
    }

    #[test]
    fn foreach_range_and_array() {
        let s = one_stmt("@splitdegree=4 foreach i, k in [0:10:2] { }");
        let StmtKind::Foreach(f) = &s.kind else { panic!() };
        assert_eq!(f.annotations[0].key.name, "splitdegree");
        assert_eq!(f.counter.as_ref().map(|c| c.name.as_str()), Some("k"));
        assert!(matches!(&f.source, ForeachSource::Range { step: Some(_), .. }));

        let s = one_stmt("foreach v in A { }");
        let StmtKind::Foreach(f) = &s.kind else { panic!() };
        assert!(matches!(&f.source, ForeachSource::Array(_)));
    }

    #[test]
    fn for_loop_header() {
        let s = one_stmt("for (int i = 0, j = 1; i < 10; i = i + 1, j = j * 2) { }");
        let StmtKind::For(f) = &s.kind else { panic!() };
        assert!(f.init[0].type_name.is_some());
        assert!(f.init[1].type_name.is_none());
        assert_eq!(f.updates.len(), 2);
    }

    #[test]
    fn iterate_wait_update() {
        let stmts = main_body(
            "main { iterate k { x = k; } until (k > 3); wait deep (A, b) { } u <incr> := 1.0; }",
        );
        assert!(matches!(stmts[0].kind, StmtKind::Iterate(_)));
        assert!(matches!(&stmts[1].kind, StmtKind::Wait(w) if w.deep && w.exprs.len() == 2));
        assert!(matches!(&stmts[2].kind, StmtKind::Update(u) if u.mode.name == "incr"));
    }

    #[test]
    fn syntax_error_is_reported() {
        let result = parse("main { x = ; }");
        assert!(!result.errors.is_empty());
    }
}
