//! Tree-walking evaluator.

use super::ast::{BinOp, Expr, UnOp};
use super::builtins::{self, NodeContext};
use crate::error::{CodecError, Stage};
use crate::value::Value;

pub fn eval(expr: &Expr, ctx: &dyn NodeContext) -> Result<Value, CodecError> {
    match expr {
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::UInt(u) => Ok(Value::UInt(*u)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => {
            if let Some(path) = s.strip_prefix(super::ast::REF_SENTINEL) {
                ctx.resolve(path)
            } else {
                Ok(Value::Str(s.clone()))
            }
        }
        Expr::Unary(op, inner) => eval_unary(*op, inner, ctx),
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
        Expr::Ternary(cond, then_e, else_e) => {
            let c = eval(cond, ctx)?;
            let truthy = c.as_bool().ok_or_else(|| runtime_err("ternary condition is not boolean-coercible"))?;
            if truthy {
                eval(then_e, ctx)
            } else {
                eval(else_e, ctx)
            }
        }
        Expr::Call(name, args) => builtins::call(name, args, ctx, &eval),
    }
}

fn runtime_err(detail: impl Into<String>) -> CodecError {
    CodecError::expr_runtime(Stage::Derive, "", detail.into())
}

fn eval_unary(op: UnOp, inner: &Expr, ctx: &dyn NodeContext) -> Result<Value, CodecError> {
    let v = eval(inner, ctx)?;
    match op {
        UnOp::Neg => {
            if let Value::Float(f) = v {
                Ok(Value::Float(-f))
            } else {
                let i = v.as_int().ok_or_else(|| runtime_err("unary '-' requires a numeric operand"))?;
                Ok(Value::Int(-i))
            }
        }
        UnOp::Not => {
            let b = v.as_bool().ok_or_else(|| runtime_err("unary '!' requires a boolean-coercible operand"))?;
            Ok(Value::Bool(!b))
        }
        UnOp::BitNot => {
            let u = v.as_uint().ok_or_else(|| runtime_err("unary '~' requires a numeric operand"))?;
            Ok(Value::UInt(!u))
        }
    }
}

fn is_float(v: &Value) -> bool {
    matches!(v, Value::Float(_))
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, ctx: &dyn NodeContext) -> Result<Value, CodecError> {
    match op {
        BinOp::And => {
            let l = eval(lhs, ctx)?.as_bool().ok_or_else(|| runtime_err("'&&' requires boolean-coercible operands"))?;
            if !l {
                return Ok(Value::Bool(false));
            }
            let r = eval(rhs, ctx)?.as_bool().ok_or_else(|| runtime_err("'&&' requires boolean-coercible operands"))?;
            return Ok(Value::Bool(r));
        }
        BinOp::Or => {
            let l = eval(lhs, ctx)?.as_bool().ok_or_else(|| runtime_err("'||' requires boolean-coercible operands"))?;
            if l {
                return Ok(Value::Bool(true));
            }
            let r = eval(rhs, ctx)?.as_bool().ok_or_else(|| runtime_err("'||' requires boolean-coercible operands"))?;
            return Ok(Value::Bool(r));
        }
        _ => {}
    }

    let l = eval(lhs, ctx)?;
    let r = eval(rhs, ctx)?;

    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            if is_float(&l) || is_float(&r) {
                let lf = l.as_float().ok_or_else(|| runtime_err("arithmetic requires numeric operands"))?;
                let rf = r.as_float().ok_or_else(|| runtime_err("arithmetic requires numeric operands"))?;
                let result = match op {
                    BinOp::Add => lf + rf,
                    BinOp::Sub => lf - rf,
                    BinOp::Mul => lf * rf,
                    BinOp::Div => {
                        if rf == 0.0 {
                            return Err(runtime_err("division by zero"));
                        }
                        lf / rf
                    }
                    BinOp::Mod => {
                        if rf == 0.0 {
                            return Err(runtime_err("division by zero"));
                        }
                        lf % rf
                    }
                    _ => unreachable!(),
                };
                Ok(Value::Float(result))
            } else {
                let li = l.as_int().ok_or_else(|| runtime_err("arithmetic requires numeric operands"))?;
                let ri = r.as_int().ok_or_else(|| runtime_err("arithmetic requires numeric operands"))?;
                let result = match op {
                    BinOp::Add => li.checked_add(ri),
                    BinOp::Sub => li.checked_sub(ri),
                    BinOp::Mul => li.checked_mul(ri),
                    BinOp::Div => {
                        if ri == 0 {
                            return Err(runtime_err("division by zero"));
                        }
                        li.checked_div(ri)
                    }
                    BinOp::Mod => {
                        if ri == 0 {
                            return Err(runtime_err("division by zero"));
                        }
                        li.checked_rem(ri)
                    }
                    _ => unreachable!(),
                };
                let result = result.ok_or_else(|| runtime_err("integer overflow in arithmetic expression"))?;
                if result >= 0 {
                    Ok(Value::UInt(result as u64))
                } else {
                    Ok(Value::Int(result))
                }
            }
        }
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&l, &r)?;
            let result = match op {
                BinOp::Eq => ordering == std::cmp::Ordering::Equal,
                BinOp::Ne => ordering != std::cmp::Ordering::Equal,
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
            let lu = l.as_uint().ok_or_else(|| runtime_err("bitwise operator requires numeric operands"))?;
            let ru = r.as_uint().ok_or_else(|| runtime_err("bitwise operator requires numeric operands"))?;
            let result = match op {
                BinOp::BitAnd => lu & ru,
                BinOp::BitOr => lu | ru,
                BinOp::BitXor => lu ^ ru,
                BinOp::Shl => lu << ru,
                BinOp::Shr => lu >> ru,
                _ => unreachable!(),
            };
            Ok(Value::UInt(result))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, CodecError> {
    if matches!(l, Value::Str(_)) && matches!(r, Value::Str(_)) {
        let ls = l.as_str().unwrap();
        let rs = r.as_str().unwrap();
        return Ok(ls.cmp(&rs));
    }
    if is_float(l) || is_float(r) {
        let lf = l.as_float().ok_or_else(|| runtime_err("comparison requires numeric operands"))?;
        let rf = r.as_float().ok_or_else(|| runtime_err("comparison requires numeric operands"))?;
        return lf.partial_cmp(&rf).ok_or_else(|| runtime_err("NaN in comparison"));
    }
    let li = l.as_int().ok_or_else(|| runtime_err("comparison requires comparable operands"))?;
    let ri = r.as_int().ok_or_else(|| runtime_err("comparison requires comparable operands"))?;
    Ok(li.cmp(&ri))
}
