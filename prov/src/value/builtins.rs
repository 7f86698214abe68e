// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The builtins table.
//!
//! These are the objects global name lookup falls back to when a name is not
//! bound anywhere in the closure chain. Each collector owns its table, so
//! builtin identities are stable within a trial.

use std::collections::HashMap;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::collector::error::UserError;
use crate::value::{CallArgs, ObjKind, ObjRef};

pub fn builtin_globals() -> HashMap<&'static str, ObjRef> {
    let mut globals = HashMap::new();
    let mut register = |name: &'static str, f: Rc<dyn Fn(&CallArgs) -> Result<ObjRef, UserError>>| {
        globals.insert(name, ObjRef::builtin(name, f));
    };

    register(
        "len",
        Rc::new(|args: &CallArgs| {
            let value = args.arg(0)?;
            value
                .len()
                .map(|n| ObjRef::int(n as i64))
                .ok_or_else(|| {
                    UserError::type_error(format!("object of type {} has no len()", value.repr()))
                })
        }),
    );

    register(
        "repr",
        Rc::new(|args: &CallArgs| Ok(ObjRef::str(args.arg(0)?.repr()))),
    );

    register(
        "print",
        Rc::new(|args: &CallArgs| {
            let parts: Vec<String> = args
                .positional
                .iter()
                .map(|v| match v.kind() {
                    ObjKind::Str(s) => s.clone(),
                    _ => v.repr(),
                })
                .collect();
            println!("{}", parts.join(" "));
            Ok(ObjRef::none())
        }),
    );

    register(
        "abs",
        Rc::new(|args: &CallArgs| match args.arg(0)?.kind() {
            ObjKind::Int(i) => Ok(ObjRef::int(i.abs())),
            ObjKind::Float(f) => Ok(ObjRef::float(f.abs())),
            other => Err(UserError::type_error(format!(
                "bad operand type for abs(): {}",
                kind_name(other)
            ))),
        }),
    );

    register(
        "sum",
        Rc::new(|args: &CallArgs| {
            let value = args.arg(0)?;
            let n = value.len().ok_or_else(|| {
                UserError::type_error(format!("{} object is not iterable", value.repr()))
            })?;
            let mut acc = 0i64;
            let mut facc = 0f64;
            let mut float = false;
            for i in 0..n {
                match value.index(i).as_ref().map(ObjRef::kind) {
                    Some(ObjKind::Int(v)) => acc += v,
                    Some(ObjKind::Float(v)) => {
                        float = true;
                        facc += v;
                    }
                    _ => {
                        return Err(UserError::type_error(
                            "unsupported operand type for +".to_owned(),
                        ))
                    }
                }
            }
            if float {
                Ok(ObjRef::float(facc + acc as f64))
            } else {
                Ok(ObjRef::int(acc))
            }
        }),
    );

    register(
        "sleep",
        Rc::new(|args: &CallArgs| {
            let seconds = match args.arg(0)?.kind() {
                ObjKind::Int(i) => *i as f64,
                ObjKind::Float(f) => *f,
                other => {
                    return Err(UserError::type_error(format!(
                        "sleep() argument must be a number, not {}",
                        kind_name(other)
                    )))
                }
            };
            thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            Ok(ObjRef::none())
        }),
    );

    globals
}

fn kind_name(kind: &ObjKind) -> &'static str {
    match kind {
        ObjKind::None => "NoneType",
        ObjKind::Bool(_) => "bool",
        ObjKind::Int(_) => "int",
        ObjKind::Float(_) => "float",
        ObjKind::Str(_) => "str",
        ObjKind::Tuple(_) => "tuple",
        ObjKind::List(_) => "list",
        ObjKind::Set(_) => "set",
        ObjKind::Dict(_) => "dict",
        ObjKind::Type(_) => "type",
        ObjKind::Function(_) => "function",
        ObjKind::Builtin(_) => "builtin_function_or_method",
        ObjKind::Module(_) => "module",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_counts_elements() {
        let globals = builtin_globals();
        let len = globals.get("len").unwrap();
        let ObjKind::Builtin(b) = len.kind() else {
            panic!("len is not a builtin");
        };
        let args = CallArgs::positional(vec![ObjRef::list(vec![
            ObjRef::int(1),
            ObjRef::int(2),
            ObjRef::int(3),
        ])]);
        assert_eq!((b.call)(&args).unwrap().as_int(), Some(3));
    }

    #[test]
    fn len_of_a_scalar_raises() {
        let globals = builtin_globals();
        let ObjKind::Builtin(b) = globals.get("len").unwrap().kind() else {
            panic!("len is not a builtin");
        };
        let err = (b.call)(&CallArgs::positional(vec![ObjRef::int(3)])).unwrap_err();
        assert_eq!(err.kind, "TypeError");
    }
}
