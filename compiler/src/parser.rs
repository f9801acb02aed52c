// Parser for .nest schema files.
//
// Parses a token stream (from the lexer) into a `Schema` AST. Uses chumsky
// combinators. Binary and unary operators are desugared into calls of the
// catalog functions they name (`a + b` becomes `add(a, b)`), so later stages
// only ever see explicit calls.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics; parsing continues.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub schema: Option<Schema>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a schema source string. Lexes then parses.
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

    let parser = schema_parser(source);
    let (schema, parse_errors) = parser.parse(stream).into_output_errors();

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
        schema,
        errors: all_errors,
    }
}

fn merge(a: Span, b: Span) -> Span {
    (a.start..b.end).into()
}

fn call(name: &str, name_span: Span, args: Vec<Expr>, span: Span) -> Expr {
    Expr::new(
        ExprKind::Call {
            func: Ident {
                name: name.to_string(),
                span: name_span,
            },
            args,
        },
        span,
    )
}

/// Build a left-associative binary call node.
fn binary(left: Expr, (name, op_span): (&'static str, Span), right: Expr) -> Expr {
    let span = merge(left.span, right.span);
    call(name, op_span, vec![left, right], span)
}

/// Build a prefix unary node, folding `-` into numeric literals.
fn unary((name, op_span): (&'static str, Span), operand: Expr) -> Expr {
    let span = merge(op_span, operand.span);
    match (name, &operand.kind) {
        ("neg", ExprKind::Literal(Literal::Integer(n))) => {
            Expr::new(ExprKind::Literal(Literal::Integer(-n)), span)
        }
        ("neg", ExprKind::Literal(Literal::Float(v))) => {
            Expr::new(ExprKind::Literal(Literal::Float(-v)), span)
        }
        _ => call(name, op_span, vec![operand], span),
    }
}

/// An operator token tagged with the catalog function it desugars to.
fn op<'tokens, I>(
    token: Token,
    name: &'static str,
) -> impl Parser<'tokens, I, (&'static str, SimpleSpan), extra::Err<Rich<'tokens, Token, SimpleSpan>>>
       + Clone
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    just(token).to(name).map_with(|name, e| (name, e.span()))
}

// ── Main parser builder ──
//
// All grammar rules are built inside `schema_parser` so that the `source`
// reference is captured once and shared by all combinators. This avoids
// complex lifetime annotations on per-rule helper functions.

fn schema_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Schema, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifiers ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // Field names and path steps may reuse keywords.
    let word = any()
        .filter(|t: &Token| t.is_word())
        .map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            Ident {
                name: source[span.start()..span.end()].to_string(),
                span,
            }
        });

    let elem_type = ident.clone().try_map(|id: Ident, span| {
        ElemType::from_name(&id.name)
            .ok_or_else(|| Rich::custom(span, format!("unknown element type '{}'", id.name)))
    });

    // ── Input block ──

    let field = recursive(|field| {
        let body = field
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace));

        let array = just(Token::Array)
            .ignore_then(word.clone())
            .then(just(Token::As).ignore_then(word.clone()).or_not())
            .then(choice((
                body.clone().map(ArrayElement::Object),
                just(Token::Of)
                    .ignore_then(elem_type.clone())
                    .map(ArrayElement::Scalar),
            )))
            .map_with(|((name, alias), element), e| InputField {
                name,
                ty: InputType::Array { alias, element },
                span: e.span(),
            });

        let object = just(Token::Object)
            .ignore_then(word.clone())
            .then(body)
            .map_with(|(name, fields), e| InputField {
                name,
                ty: InputType::Object(fields),
                span: e.span(),
            });

        let scalar = elem_type
            .clone()
            .then(word.clone())
            .map_with(|(ty, name), e| InputField {
                name,
                ty: InputType::Scalar(ty),
                span: e.span(),
            });

        choice((array, object, scalar))
    });

    let input_block = just(Token::Input).ignore_then(
        field
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace)),
    );

    // ── Expressions ──

    let expr = recursive(|expr| {
        let literal = select! {
            Token::Integer(n) => Literal::Integer(n),
            Token::Float(v) => Literal::Float(v),
            Token::Str(s) => Literal::String(s),
            Token::True => Literal::Boolean(true),
            Token::False => Literal::Boolean(false),
            Token::Null => Literal::Null,
        }
        .map_with(|lit, e| Expr::new(ExprKind::Literal(lit), e.span()));

        let input_path = just(Token::Input)
            .ignore_then(
                just(Token::Dot)
                    .ignore_then(word.clone())
                    .repeated()
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .map_with(|steps, e| Expr::new(ExprKind::Input(steps), e.span()));

        let args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        // `name(args)` is a call, a bare `name` references a declaration.
        let call_or_ref = ident
            .clone()
            .then(args.or_not())
            .map_with(|(name, args), e| match args {
                Some(args) => Expr::new(ExprKind::Call { func: name, args }, e.span()),
                None => Expr::new(ExprKind::Ref(name), e.span()),
            });

        let arm = just(Token::When)
            .ignore_then(expr.clone())
            .then_ignore(just(Token::FatArrow))
            .then(expr.clone())
            .then_ignore(just(Token::Comma).or_not());

        let cascade = just(Token::Cascade)
            .ignore_then(
                arm.repeated()
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .then(
                        just(Token::Else)
                            .ignore_then(expr.clone())
                            .then_ignore(just(Token::Comma).or_not())
                            .or_not(),
                    )
                    .delimited_by(just(Token::LBrace), just(Token::RBrace)),
            )
            .map_with(|(arms, default), e| {
                Expr::new(
                    ExprKind::Cascade {
                        arms,
                        default: default.map(Box::new),
                    },
                    e.span(),
                )
            });

        let array_literal = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map_with(|items, e| Expr::new(ExprKind::Array(items), e.span()));

        let object_literal = word
            .clone()
            .then_ignore(just(Token::Colon))
            .then(expr.clone())
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|fields, e| Expr::new(ExprKind::Object(fields), e.span()));

        let parens = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let atom = choice((
            literal,
            input_path,
            cascade,
            array_literal,
            object_literal,
            parens,
            call_or_ref,
        ));

        // ── Unary ──

        let unary_op = choice((
            just(Token::Minus).to("neg"),
            just(Token::Not).to("not"),
            just(Token::Bang).to("not"),
        ))
        .map_with(|name, e| (name, e.span()));

        let unary_expr = unary_op.repeated().foldr(atom, unary);

        // ── Binary operators, tightest first ──

        let product = unary_expr.clone().foldl(
            choice((
                op(Token::Star, "mul"),
                op(Token::Slash, "div"),
                op(Token::Percent, "mod"),
            ))
            .then(unary_expr)
            .repeated(),
            |left, (op, right)| binary(left, op, right),
        );

        let sum = product.clone().foldl(
            choice((op(Token::Plus, "add"), op(Token::Minus, "sub")))
                .then(product)
                .repeated(),
            |left, (op, right)| binary(left, op, right),
        );

        let comparison = sum.clone().foldl(
            choice((
                op(Token::EqEq, "eq"),
                op(Token::BangEq, "ne"),
                op(Token::LtEq, "le"),
                op(Token::GtEq, "ge"),
                op(Token::Lt, "lt"),
                op(Token::Gt, "gt"),
            ))
            .then(sum)
            .repeated(),
            |left, (op, right)| binary(left, op, right),
        );

        let conjunction = comparison.clone().foldl(
            op(Token::And, "and").then(comparison).repeated(),
            |left, (op, right)| binary(left, op, right),
        );

        conjunction
            .clone()
            .foldl(
                op(Token::Or, "or").then(conjunction).repeated(),
                |left, (op, right)| binary(left, op, right),
            )
            .boxed()
    });

    // ── Declarations ──

    let decl = choice((
        just(Token::Value).to(DeclKind::Value),
        just(Token::Trait).to(DeclKind::Trait),
    ))
    .then(ident)
    .then_ignore(just(Token::Equals))
    .then(expr)
    .map_with(|((kind, name), expr), e| Decl {
        kind,
        name,
        expr,
        span: e.span(),
    });

    // ── Schema ──

    input_block
        .or_not()
        .then(decl.repeated().collect::<Vec<_>>())
        .map_with(|(inputs, decls), e| Schema {
            inputs: inputs.unwrap_or_default(),
            decls,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Schema {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.schema.expect("expected schema")
    }

    fn parse_expr(source: &str) -> Expr {
        let schema = parse_ok(&format!("value x = {source}"));
        schema.decls.into_iter().next().unwrap().expr
    }

    /// Render an expression as s-expressions for compact assertions.
    fn sexpr(expr: &Expr) -> String {
        match &expr.kind {
            ExprKind::Literal(lit) => lit.to_string(),
            ExprKind::Input(steps) => format!(
                "input.{}",
                steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(".")
            ),
            ExprKind::Ref(name) => name.name.clone(),
            ExprKind::Call { func, args } => format!(
                "({} {})",
                func.name,
                args.iter().map(sexpr).collect::<Vec<_>>().join(" ")
            ),
            ExprKind::Cascade { arms, default } => {
                let mut out = String::from("(cascade");
                for (c, v) in arms {
                    out.push_str(&format!(" [{} {}]", sexpr(c), sexpr(v)));
                }
                if let Some(d) = default {
                    out.push_str(&format!(" else {}", sexpr(d)));
                }
                out.push(')');
                out
            }
            ExprKind::Array(items) => format!(
                "[{}]",
                items.iter().map(sexpr).collect::<Vec<_>>().join(" ")
            ),
            ExprKind::Object(fields) => format!(
                "{{{}}}",
                fields
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.name, sexpr(v)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    // ── Input block ──

    #[test]
    fn empty_schema() {
        let schema = parse_ok("");
        assert!(schema.inputs.is_empty());
        assert!(schema.decls.is_empty());
    }

    #[test]
    fn input_block_fields() {
        let schema = parse_ok(
            "input {
                array items { float price integer quantity }
                object config { float bias }
                array tags of string
                string title
            }",
        );
        assert_eq!(schema.inputs.len(), 4);
        match &schema.inputs[0].ty {
            InputType::Array { alias, element } => {
                assert!(alias.is_none());
                match element {
                    ArrayElement::Object(fields) => assert_eq!(fields.len(), 2),
                    other => panic!("expected object element, got {:?}", other),
                }
            }
            other => panic!("expected array, got {:?}", other),
        }
        assert!(matches!(schema.inputs[1].ty, InputType::Object(_)));
        assert!(matches!(
            schema.inputs[2].ty,
            InputType::Array {
                element: ArrayElement::Scalar(ElemType::String),
                ..
            }
        ));
        assert_eq!(schema.inputs[3].ty, InputType::Scalar(ElemType::String));
        assert_eq!(schema.inputs[3].name.name, "title");
    }

    #[test]
    fn array_alias() {
        let schema = parse_ok("input { array employees as emp { float salary } }");
        match &schema.inputs[0].ty {
            InputType::Array { alias: Some(a), .. } => assert_eq!(a.name, "emp"),
            other => panic!("expected aliased array, got {:?}", other),
        }
    }

    #[test]
    fn keyword_field_names() {
        let schema = parse_ok("input { object order { float value } } value v = input.order.value");
        assert_eq!(sexpr(&schema.decls[0].expr), "input.order.value");
    }

    #[test]
    fn unknown_element_type_rejected() {
        let result = parse("input { matrix m }");
        assert!(!result.errors.is_empty());
    }

    // ── Declarations ──

    #[test]
    fn value_and_trait() {
        let schema = parse_ok("value a = 1 trait b = a > 0");
        assert_eq!(schema.decls.len(), 2);
        assert_eq!(schema.decls[0].kind, DeclKind::Value);
        assert_eq!(schema.decls[1].kind, DeclKind::Trait);
        assert_eq!(schema.decls[1].name.name, "b");
    }

    #[test]
    fn precedence() {
        assert_eq!(sexpr(&parse_expr("1 + 2 * 3")), "(add 1 (mul 2 3))");
        assert_eq!(sexpr(&parse_expr("(1 + 2) * 3")), "(mul (add 1 2) 3)");
        assert_eq!(sexpr(&parse_expr("a - b - c")), "(sub (sub a b) c)");
        assert_eq!(
            sexpr(&parse_expr("a < 1 and b or not c")),
            "(or (and (lt a 1) b) (not c))"
        );
    }

    #[test]
    fn negative_literals_fold() {
        assert_eq!(sexpr(&parse_expr("-3")), "-3");
        assert_eq!(sexpr(&parse_expr("-x")), "(neg x)");
        assert_eq!(sexpr(&parse_expr("2 * -1.5")), "(mul 2 -1.5)");
    }

    #[test]
    fn calls_and_refs() {
        assert_eq!(
            sexpr(&parse_expr("sum(input.items.price * input.items.quantity)")),
            "(sum (mul input.items.price input.items.quantity))"
        );
        assert_eq!(sexpr(&parse_expr("subtotal")), "subtotal");
    }

    #[test]
    fn cascade() {
        let expr = parse_expr("cascade { when x > 10 => \"high\", when x > 5 => \"mid\" else \"low\" }");
        assert_eq!(
            sexpr(&expr),
            "(cascade [(gt x 10) \"high\"] [(gt x 5) \"mid\"] else \"low\")"
        );
    }

    #[test]
    fn cascade_without_else_parses() {
        let expr = parse_expr("cascade { when a => 1 }");
        assert!(matches!(expr.kind, ExprKind::Cascade { default: None, .. }));
    }

    #[test]
    fn array_and_object_literals() {
        assert_eq!(sexpr(&parse_expr("[1, 2, a]")), "[1 2 a]");
        assert_eq!(sexpr(&parse_expr("{ total: t, n: 1 }")), "{total: t, n: 1}");
    }

    #[test]
    fn spans_cover_binary_expressions() {
        let schema = parse_ok("value x = a + bb");
        let expr = &schema.decls[0].expr;
        assert_eq!(expr.span.start, 10);
        assert_eq!(expr.span.end, 16);
    }

    // ── Errors ──

    #[test]
    fn missing_equals() {
        let result = parse("value x 1");
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn lex_errors_merged() {
        let result = parse("value x = 1 $");
        assert!(!result.errors.is_empty());
    }
}
