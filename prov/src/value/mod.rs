// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The guest value model.
//!
//! The collector shadows a dynamic host language, so hooks observe values
//! through [`ObjRef`]: a cheap reference-counted handle whose *pointer*
//! identity is the object identity the bind rule compares. Values know their
//! kind, render a `repr`, and expose just enough structure (length, indexing,
//! dict keys) for compartment capture and unpack-assignment.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use prov_shared::{ActivationId, CodeBlockId, CodeComponentId};

use crate::collector::error::{ExecutionError, UserError};
use crate::collector::Hooks;
use crate::scope::Dep;

mod builtins;

pub use builtins::builtin_globals;

/// A native callable (builtin). Builtins never re-enter the collector.
pub type NativeFn = Rc<dyn Fn(&CallArgs) -> Result<ObjRef, UserError>>;

/// The body of a defined guest function. Bodies re-enter the collector
/// through the hook surface; the activation is the one started for the call.
pub type BodyFn = Rc<dyn Fn(&mut dyn Hooks, ActivationId, &CallArgs) -> Result<ObjRef, ExecutionError>>;

/// Arguments of one call, as the transformed call site evaluates them.
#[derive(Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<ObjRef>,
    pub keywords: Vec<(String, ObjRef)>,
}

impl CallArgs {
    pub fn positional(args: Vec<ObjRef>) -> Self {
        CallArgs {
            positional: args,
            keywords: Vec::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Result<&ObjRef, UserError> {
        self.positional
            .get(index)
            .ok_or_else(|| UserError::type_error(format!("missing argument {index}")))
    }
}

/// A type object. One canonical instance per kind lives in [`TypeRegistry`];
/// the registry's root (`type`) is its own type.
#[derive(Clone, Debug)]
pub struct TypeObj {
    pub name: &'static str,
}

/// A builtin callable.
#[derive(Clone)]
pub struct Builtin {
    pub name: &'static str,
    pub call: NativeFn,
}

/// A defined guest function: the decorated form produced by the
/// `function_def` hook. Calling it routes through parameter matching before
/// the body runs.
#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub block_id: CodeBlockId,
    /// The activation the function was defined in; becomes the callee's
    /// closure link.
    pub closure: ActivationId,
    pub params: ParamSpec,
    /// Dependencies of the default-value expressions, captured at definition.
    pub defaults: Vec<Dep>,
    pub body: BodyFn,
}

/// A declared parameter: name plus the code component of its binding site.
#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: String,
    pub code_id: CodeComponentId,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, code_id: CodeComponentId) -> Self {
        ParamDecl {
            name: name.into(),
            code_id,
        }
    }
}

/// The parameter list of a function definition, as the definition-time
/// analyser describes it.
#[derive(Clone, Debug, Default)]
pub struct ParamSpec {
    pub args: Vec<ParamDecl>,
    pub vararg: Option<ParamDecl>,
    pub kwarg: Option<ParamDecl>,
    pub kw_only: Vec<ParamDecl>,
}

pub enum ObjKind {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjRef>),
    List(RefCell<Vec<ObjRef>>),
    Set(RefCell<Vec<ObjRef>>),
    Dict(RefCell<Vec<(ObjRef, ObjRef)>>),
    Type(TypeObj),
    Function(Function),
    Builtin(Builtin),
    Module(String),
}

pub struct Obj {
    kind: ObjKind,
}

/// Handle to a guest object. Cloning shares identity.
#[derive(Clone)]
pub struct ObjRef(Rc<Obj>);

impl ObjRef {
    fn from_kind(kind: ObjKind) -> Self {
        ObjRef(Rc::new(Obj { kind }))
    }

    pub fn none() -> Self {
        Self::from_kind(ObjKind::None)
    }

    pub fn bool_(b: bool) -> Self {
        Self::from_kind(ObjKind::Bool(b))
    }

    pub fn int(i: i64) -> Self {
        Self::from_kind(ObjKind::Int(i))
    }

    pub fn float(f: f64) -> Self {
        Self::from_kind(ObjKind::Float(f))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::from_kind(ObjKind::Str(s.into()))
    }

    pub fn tuple(items: Vec<ObjRef>) -> Self {
        Self::from_kind(ObjKind::Tuple(items))
    }

    pub fn list(items: Vec<ObjRef>) -> Self {
        Self::from_kind(ObjKind::List(RefCell::new(items)))
    }

    pub fn set(items: Vec<ObjRef>) -> Self {
        Self::from_kind(ObjKind::Set(RefCell::new(items)))
    }

    pub fn dict(pairs: Vec<(ObjRef, ObjRef)>) -> Self {
        Self::from_kind(ObjKind::Dict(RefCell::new(pairs)))
    }

    pub fn module(name: impl Into<String>) -> Self {
        Self::from_kind(ObjKind::Module(name.into()))
    }

    pub fn function(f: Function) -> Self {
        Self::from_kind(ObjKind::Function(f))
    }

    pub fn builtin(name: &'static str, call: NativeFn) -> Self {
        Self::from_kind(ObjKind::Builtin(Builtin { name, call }))
    }

    pub(crate) fn type_obj(name: &'static str) -> Self {
        Self::from_kind(ObjKind::Type(TypeObj { name }))
    }

    pub fn kind(&self) -> &ObjKind {
        &self.0.kind
    }

    /// Object identity: stable for the lifetime of the handle graph.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn is(&self, other: &ObjRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Immutable values only qualify for the bind rule when they are the
    /// scope's sole dependency.
    pub fn is_immutable(&self) -> bool {
        matches!(
            self.kind(),
            ObjKind::None
                | ObjKind::Bool(_)
                | ObjKind::Int(_)
                | ObjKind::Float(_)
                | ObjKind::Str(_)
                | ObjKind::Tuple(_)
        )
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind(), ObjKind::Function(_) | ObjKind::Builtin(_))
    }

    pub fn is_iterable(&self) -> bool {
        matches!(
            self.kind(),
            ObjKind::Str(_)
                | ObjKind::Tuple(_)
                | ObjKind::List(_)
                | ObjKind::Set(_)
                | ObjKind::Dict(_)
        )
    }

    pub fn len(&self) -> Option<usize> {
        match self.kind() {
            ObjKind::Str(s) => Some(s.chars().count()),
            ObjKind::Tuple(items) => Some(items.len()),
            ObjKind::List(items) => Some(items.borrow().len()),
            ObjKind::Set(items) => Some(items.borrow().len()),
            ObjKind::Dict(pairs) => Some(pairs.borrow().len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Positional element access. Sets yield insertion order; dicts yield the
    /// i-th key, matching host iteration order.
    pub fn index(&self, i: usize) -> Option<ObjRef> {
        match self.kind() {
            ObjKind::Str(s) => s.chars().nth(i).map(|c| ObjRef::str(c.to_string())),
            ObjKind::Tuple(items) => items.get(i).cloned(),
            ObjKind::List(items) => items.borrow().get(i).cloned(),
            ObjKind::Set(items) => items.borrow().get(i).cloned(),
            ObjKind::Dict(pairs) => pairs.borrow().get(i).map(|(k, _)| k.clone()),
            _ => None,
        }
    }

    /// `self[start..end]` as a fresh list. Out-of-range indices are skipped.
    pub fn slice(&self, start: usize, end: usize) -> ObjRef {
        let items = (start..end).filter_map(|i| self.index(i)).collect();
        ObjRef::list(items)
    }

    pub fn dict_keys(&self) -> Option<Vec<ObjRef>> {
        match self.kind() {
            ObjKind::Dict(pairs) => Some(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
            _ => None,
        }
    }

    pub fn dict_get(&self, key: &ObjRef) -> Option<ObjRef> {
        match self.kind() {
            ObjKind::Dict(pairs) => pairs
                .borrow()
                .iter()
                .find(|(k, _)| k.value_eq(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Structural equality for scalars and strings, identity otherwise.
    pub fn value_eq(&self, other: &ObjRef) -> bool {
        match (self.kind(), other.kind()) {
            (ObjKind::None, ObjKind::None) => true,
            (ObjKind::Bool(a), ObjKind::Bool(b)) => a == b,
            (ObjKind::Int(a), ObjKind::Int(b)) => a == b,
            (ObjKind::Float(a), ObjKind::Float(b)) => a == b,
            (ObjKind::Str(a), ObjKind::Str(b)) => a == b,
            _ => self.is(other),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.kind() {
            ObjKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind() {
            ObjKind::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Name a callable presents to the call hook.
    pub fn callable_name(&self) -> String {
        match self.kind() {
            ObjKind::Function(f) => f.name.clone(),
            ObjKind::Builtin(b) => b.name.to_owned(),
            ObjKind::Type(t) => t.name.to_owned(),
            _ => "<object>".to_owned(),
        }
    }

    /// Host-style rendering of the observed object state.
    pub fn repr(&self) -> String {
        match self.kind() {
            ObjKind::None => "None".to_owned(),
            ObjKind::Bool(true) => "True".to_owned(),
            ObjKind::Bool(false) => "False".to_owned(),
            ObjKind::Int(i) => i.to_string(),
            ObjKind::Float(f) => format!("{f:?}"),
            ObjKind::Str(s) => repr_str(s),
            ObjKind::Tuple(items) => match items.len() {
                1 => format!("({},)", items[0].repr()),
                _ => format!("({})", join_reprs(items)),
            },
            ObjKind::List(items) => format!("[{}]", join_reprs(&items.borrow())),
            ObjKind::Set(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    "set()".to_owned()
                } else {
                    format!("{{{}}}", join_reprs(&items))
                }
            }
            ObjKind::Dict(pairs) => {
                let body: Vec<String> = pairs
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            ObjKind::Type(t) => format!("<class '{}'>", t.name),
            ObjKind::Function(f) => format!("<function {}>", f.name),
            ObjKind::Builtin(b) => format!("<built-in function {}>", b.name),
            ObjKind::Module(name) => format!("<module '{name}'>"),
        }
    }
}

fn join_reprs(items: &[ObjRef]) -> String {
    let parts: Vec<String> = items.iter().map(ObjRef::repr).collect();
    parts.join(", ")
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// Canonical type objects, one per kind, plus the self-typed root.
///
/// `type_of(root)` returns the root itself; readers detect termination by
/// identity, never by a null link.
pub struct TypeRegistry {
    root: ObjRef,
    none: ObjRef,
    bool_: ObjRef,
    int: ObjRef,
    float: ObjRef,
    str_: ObjRef,
    tuple: ObjRef,
    list: ObjRef,
    set: ObjRef,
    dict: ObjRef,
    function: ObjRef,
    builtin: ObjRef,
    module: ObjRef,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            root: ObjRef::type_obj("type"),
            none: ObjRef::type_obj("NoneType"),
            bool_: ObjRef::type_obj("bool"),
            int: ObjRef::type_obj("int"),
            float: ObjRef::type_obj("float"),
            str_: ObjRef::type_obj("str"),
            tuple: ObjRef::type_obj("tuple"),
            list: ObjRef::type_obj("list"),
            set: ObjRef::type_obj("set"),
            dict: ObjRef::type_obj("dict"),
            function: ObjRef::type_obj("function"),
            builtin: ObjRef::type_obj("builtin_function_or_method"),
            module: ObjRef::type_obj("module"),
        }
    }

    pub fn root(&self) -> &ObjRef {
        &self.root
    }

    pub fn is_root(&self, value: &ObjRef) -> bool {
        value.is(&self.root)
    }

    pub fn type_of(&self, value: &ObjRef) -> ObjRef {
        match value.kind() {
            ObjKind::None => self.none.clone(),
            ObjKind::Bool(_) => self.bool_.clone(),
            ObjKind::Int(_) => self.int.clone(),
            ObjKind::Float(_) => self.float.clone(),
            ObjKind::Str(_) => self.str_.clone(),
            ObjKind::Tuple(_) => self.tuple.clone(),
            ObjKind::List(_) => self.list.clone(),
            ObjKind::Set(_) => self.set.clone(),
            ObjKind::Dict(_) => self.dict.clone(),
            ObjKind::Type(_) => self.root.clone(),
            ObjKind::Function(_) => self.function.clone(),
            ObjKind::Builtin(_) => self.builtin.clone(),
            ObjKind::Module(_) => self.module.clone(),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}
