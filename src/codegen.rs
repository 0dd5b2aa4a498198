// AST to textual LLVM IR.
//
// The central decision is the observer effect: a scalar binding
// whose name the resolver marked observed lives as a tracked-scalar
// record and every assignment goes through the runtime, while an
// unobserved binding is a plain double slot and all arithmetic stays
// native. Handles (lists, strings, matrices) travel as typed
// pointers inside a module and are folded into encoded doubles only
// where a value has to fit a double-shaped slot.
//
// Emission is plain text. Each function keeps an entry buffer for
// allocas and a body buffer for instructions, so lifetimes always
// start in the entry block no matter where a name first appears.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;

use tracing::debug;

use crate::ast::{BinOp, Expr, ModuleDoc, PredicateKind, QuestionKind, SourceLoc, Stmt, UnOp};
use crate::config::CodegenOptions;
use crate::error::{Diagnostic, Error, Result};
use crate::ir::{self, AttrSet, RuntimeFn};

// Static kind of a value flowing through the emitter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Num,
    List,
    Str,
    Matrix,
}

impl Kind {
    fn is_handle(self) -> bool {
        self != Kind::Num
    }

    fn name(self) -> &'static str {
        match self {
            Kind::Num => "number",
            Kind::List => "list",
            Kind::Str => "string",
            Kind::Matrix => "matrix",
        }
    }
}

// An evaluated expression: IR operand text plus its kind. Numbers
// are `double` operands (register or immediate), handles are `ptr`.
#[derive(Clone, Debug)]
struct Val {
    text: String,
    kind: Kind,
}

impl Val {
    fn num(text: impl Into<String>) -> Val {
        Val {
            text: text.into(),
            kind: Kind::Num,
        }
    }

    fn imm(v: f64) -> Val {
        Val::num(ir::double_constant(v))
    }

    fn handle(text: impl Into<String>, kind: Kind) -> Val {
        Val {
            text: text.into(),
            kind,
        }
    }
}

// Where a name lives.
#[derive(Clone, Debug)]
enum Slot {
    // alloca double
    Fast { ptr: String },
    // alloca %eigen.tracked; the slot is the record itself
    Tracked { ptr: String },
    // alloca ptr
    Handle { ptr: String, kind: Kind },
    // @__eigs_global_<name> holding a raw double
    GlobalFast { sym: String },
    // @__eigs_global_<name> holding a pointer to a heap record
    GlobalTracked { sym: String, created: bool },
    GlobalHandle { sym: String, kind: Kind },
}

struct LoopLabels {
    cont: String,
    brk: String,
}

// Per-function emission state.
struct FuncState {
    entry: String,
    body: String,
    tmp: usize,
    label: usize,
    locals: HashMap<String, Slot>,
    loops: Vec<LoopLabels>,
    terminated: bool,
    // True when this region contains an unscoped predicate, which
    // makes every scalar assignment feed the process-wide tracker.
    tracks: bool,
    // Module top level owns creation of tracked globals; function
    // bodies only ever update them.
    at_top_level: bool,
}

impl FuncState {
    fn new(tracks: bool, at_top_level: bool) -> FuncState {
        FuncState {
            entry: String::new(),
            body: String::new(),
            tmp: 0,
            label: 0,
            locals: HashMap::new(),
            loops: Vec::new(),
            terminated: false,
            tracks,
            at_top_level,
        }
    }

    fn tmp(&mut self) -> String {
        self.tmp += 1;
        format!("%t{}", self.tmp)
    }

    fn label(&mut self, stem: &str) -> String {
        self.label += 1;
        format!("{}.{}", stem, self.label)
    }

    fn alloca(&mut self, name: &str, ty: &str) {
        let _ = writeln!(self.entry, "  {} = alloca {}", name, ty);
    }

    // Ordinary instruction. Instructions after a terminator open an
    // unreachable continuation block so the block structure stays
    // well formed.
    fn inst(&mut self, text: &str) {
        if self.terminated {
            let l = self.label("dead");
            self.begin_block(&l);
        }
        let _ = writeln!(self.body, "  {}", text);
    }

    fn term(&mut self, text: &str) {
        if self.terminated {
            return;
        }
        let _ = writeln!(self.body, "  {}", text);
        self.terminated = true;
    }

    fn begin_block(&mut self, label: &str) {
        // Fall through into the new block if the previous one is
        // still open.
        if !self.terminated {
            let _ = writeln!(self.body, "  br label %{}", label);
        }
        let _ = writeln!(self.body, "{}:", label);
        self.terminated = false;
    }
}

pub struct CodeGen {
    opts: CodegenOptions,
    decls: BTreeSet<RuntimeFn>,
    attr_groups: Vec<AttrSet>,
    // literal text -> constant id
    string_ids: HashMap<String, usize>,
    strings: String,
    globals: String,
    funcs: String,
    // user functions defined in this module: name -> arity
    functions: BTreeMap<String, usize>,
    global_slots: HashMap<String, Slot>,
    // called but not defined here: name -> arity
    external_fns: BTreeMap<String, usize>,
    // referenced top-level names defined elsewhere
    external_globals: BTreeSet<String>,
    // imported modules whose init must be declared
    imports: BTreeSet<String>,
}

impl CodeGen {
    pub fn new(opts: CodegenOptions) -> CodeGen {
        CodeGen {
            opts,
            decls: BTreeSet::new(),
            attr_groups: Vec::new(),
            string_ids: HashMap::new(),
            strings: String::new(),
            globals: String::new(),
            funcs: String::new(),
            functions: BTreeMap::new(),
            global_slots: HashMap::new(),
            external_fns: BTreeMap::new(),
            external_globals: BTreeSet::new(),
            imports: BTreeSet::new(),
        }
    }

    /// Lower a whole module document to textual IR.
    pub fn emit_module(&mut self, doc: &ModuleDoc) -> Result<String> {
        debug!(module = %self.opts.module_name, "emitting module");
        self.collect_functions(&doc.program)?;
        self.collect_globals(&doc.program);

        for stmt in &doc.program {
            if let Stmt::FunctionDef { name, params, body, loc } = stmt {
                self.emit_function(name, params, body, *loc)?;
            }
        }
        self.emit_entry(&doc.program)?;
        Ok(self.assemble())
    }

    fn observed(&self, name: &str) -> bool {
        self.opts.observed_variables.contains(name)
    }

    fn attr_group(&mut self, set: AttrSet) -> usize {
        if let Some(i) = self.attr_groups.iter().position(|s| *s == set) {
            return i;
        }
        self.attr_groups.push(set);
        self.attr_groups.len() - 1
    }

    // Record a runtime dependency and build one call to it.
    fn call_runtime(&mut self, f: &mut FuncState, func: RuntimeFn, args: &[String]) -> String {
        self.decls.insert(func);
        let args = args.join(", ");
        if func.ret() == "void" {
            f.inst(&format!("call void @{}({})", func.symbol(), args));
            String::new()
        } else {
            let out = f.tmp();
            f.inst(&format!(
                "{} = call {} @{}({})",
                out,
                func.ret(),
                func.symbol(),
                args
            ));
            out
        }
    }

    // ------------------------------------------------------------------
    // Module pre-passes

    fn collect_functions(&mut self, program: &[Stmt]) -> Result<()> {
        for stmt in program {
            if let Stmt::FunctionDef { name, params, loc, .. } = stmt {
                let arity = if params.is_empty() { 1 } else { params.len() };
                if self.functions.insert(name.clone(), arity).is_some() {
                    return Err(Error::Compile(
                        Diagnostic::new(format!("function `{}` defined twice", name)).at(*loc),
                    ));
                }
            }
        }
        Ok(())
    }

    // Every name assigned at module top level (including inside
    // top-level control flow) becomes a module global. Kinds resolve
    // in order of first assignment so later initializers can refer
    // to earlier bindings.
    fn collect_globals(&mut self, program: &[Stmt]) {
        let mut firsts: Vec<(String, Option<&Expr>)> = Vec::new();
        let mut seen = BTreeSet::new();
        collect_assigned(program, &mut |name, value| {
            if seen.insert(name.to_string()) {
                firsts.push((name.to_string(), value));
            }
        });

        let mut kinds: HashMap<String, Kind> = HashMap::new();
        let mut order: Vec<(String, Kind)> = Vec::new();
        for (name, value) in firsts {
            let kind = value.map(|e| shallow_kind(e, &kinds)).unwrap_or(Kind::Num);
            kinds.insert(name.clone(), kind);
            order.push((name, kind));
        }

        for (name, kind) in order {
            let sym = ir::global_symbol(&name);
            let slot = if self.observed(&name) {
                let _ = writeln!(self.globals, "{} = global ptr null", sym);
                Slot::GlobalTracked { sym, created: false }
            } else if kind.is_handle() {
                let _ = writeln!(self.globals, "{} = global ptr null", sym);
                Slot::GlobalHandle { sym, kind }
            } else {
                let _ = writeln!(
                    self.globals,
                    "{} = global double {}",
                    sym,
                    ir::double_constant(0.0)
                );
                Slot::GlobalFast { sym }
            };
            self.global_slots.insert(name, slot);
        }
    }

    // ------------------------------------------------------------------
    // Functions and entry points

    fn emit_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        loc: SourceLoc,
    ) -> Result<()> {
        // The surface syntax binds a single implicit parameter when
        // none are declared.
        let implicit = [String::from("n")];
        let params: &[String] = if params.is_empty() { &implicit } else { params };

        let mut f = FuncState::new(region_has_unscoped_predicate(body), false);
        for p in params {
            let raw = format!("%{}", ir::sanitize(p));
            if self.observed(p) {
                let slot = format!("%{}.t", ir::sanitize(p));
                f.alloca(&slot, "%eigen.tracked");
                self.call_runtime(
                    &mut f,
                    RuntimeFn::TrackedInit,
                    &[format!("ptr {}", slot), format!("double {}", raw)],
                );
                f.locals.insert(p.clone(), Slot::Tracked { ptr: slot });
            } else {
                let slot = format!("%{}.slot", ir::sanitize(p));
                f.alloca(&slot, "double");
                f.inst(&format!("store double {}, ptr {}", raw, slot));
                f.locals.insert(p.clone(), Slot::Fast { ptr: slot });
            }
        }

        for stmt in body {
            if let Stmt::FunctionDef { loc, .. } = stmt {
                return Err(Error::Compile(
                    Diagnostic::new("nested function definitions are not supported").at(*loc),
                ));
            }
            self.emit_stmt(&mut f, stmt)?;
        }
        f.term(&format!("ret double {}", ir::double_constant(0.0)));

        let group = self.attr_group(ir::Attr::NoUnwind.into());
        let sig: Vec<String> = params
            .iter()
            .map(|p| format!("double %{}", ir::sanitize(p)))
            .collect();
        let _ = writeln!(
            self.funcs,
            "define double {}({}) #{} {{\nentry:\n{}{}}}\n",
            ir::function_symbol(&self.opts.module_name, name),
            sig.join(", "),
            group,
            f.entry,
            f.body
        );
        debug!(function = name, at = ?loc, "lowered function");
        Ok(())
    }

    // The module entry: `main` in normal mode, `<module>_init` with
    // external linkage in library mode.
    fn emit_entry(&mut self, program: &[Stmt]) -> Result<()> {
        let top: Vec<&Stmt> = program
            .iter()
            .filter(|s| !matches!(s, Stmt::FunctionDef { .. }))
            .collect();
        let mut f = FuncState::new(region_has_unscoped_predicate_refs(&top), true);

        if !self.opts.library_mode {
            self.call_runtime(
                &mut f,
                RuntimeFn::InitArgs,
                &[String::from("i32 %argc"), String::from("ptr %argv")],
            );
        }
        for stmt in top {
            self.emit_stmt(&mut f, stmt)?;
        }

        let group = self.attr_group(ir::Attr::NoUnwind.into());
        if self.opts.library_mode {
            f.term("ret void");
            let _ = writeln!(
                self.funcs,
                "define void {}() #{} {{\nentry:\n{}{}}}\n",
                ir::init_symbol(&self.opts.module_name),
                group,
                f.entry,
                f.body
            );
        } else {
            f.term("ret i32 0");
            let _ = writeln!(
                self.funcs,
                "define i32 @main(i32 %argc, ptr %argv) #{} {{\nentry:\n{}{}}}\n",
                group,
                f.entry,
                f.body
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements

    fn emit_stmt(&mut self, f: &mut FuncState, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { name, value, loc } => {
                let val = self.eval(f, value, *loc)?;
                self.assign(f, name, val, *loc)
            }
            Stmt::Expr { value, loc } => {
                self.eval(f, value, *loc)?;
                Ok(())
            }
            Stmt::Return { value, loc } => {
                let val = match value {
                    Some(e) => self.eval(f, e, *loc)?,
                    None => Val::imm(0.0),
                };
                let val = self.as_number(f, val);
                f.term(&format!("ret double {}", val.text));
                Ok(())
            }
            Stmt::If { cond, then, otherwise, loc } => self.emit_if(f, cond, then, otherwise, *loc),
            Stmt::While { cond, body, loc } => self.emit_while(f, cond, body, *loc),
            Stmt::ForIn { name, iter, body, loc } => self.emit_for_in(f, name, iter, body, *loc),
            Stmt::Break { loc } => match f.loops.last() {
                Some(labels) => {
                    let target = labels.brk.clone();
                    f.term(&format!("br label %{}", target));
                    Ok(())
                }
                None => Err(Error::Compile(
                    Diagnostic::new("break outside of a loop").at(*loc),
                )),
            },
            Stmt::Continue { loc } => match f.loops.last() {
                Some(labels) => {
                    let target = labels.cont.clone();
                    f.term(&format!("br label %{}", target));
                    Ok(())
                }
                None => Err(Error::Compile(
                    Diagnostic::new("continue outside of a loop").at(*loc),
                )),
            },
            Stmt::Import { module, .. } => {
                self.imports.insert(module.clone());
                f.inst(&format!("call void {}()", ir::init_symbol(module)));
                Ok(())
            }
            Stmt::FunctionDef { loc, .. } => Err(Error::Compile(
                Diagnostic::new("function definition below module top level").at(*loc),
            )),
        }
    }

    fn assign(&mut self, f: &mut FuncState, name: &str, val: Val, loc: SourceLoc) -> Result<()> {
        let tracked_value = match self.slot_of(f, name) {
            Some(Slot::Fast { ptr }) => {
                let val = self.expect_kind(f, val, Kind::Num, name, loc)?;
                f.inst(&format!("store double {}, ptr {}", val.text, ptr));
                Some(val.text)
            }
            Some(Slot::Tracked { ptr }) => {
                let val = self.as_number(f, val);
                self.call_runtime(
                    f,
                    RuntimeFn::TrackedUpdate,
                    &[format!("ptr {}", ptr), format!("double {}", val.text)],
                );
                Some(val.text)
            }
            Some(Slot::Handle { ptr, kind }) => {
                let val = self.expect_kind(f, val, kind, name, loc)?;
                f.inst(&format!("store ptr {}, ptr {}", val.text, ptr));
                None
            }
            Some(Slot::GlobalFast { sym }) => {
                let val = self.expect_kind(f, val, Kind::Num, name, loc)?;
                f.inst(&format!("store double {}, ptr {}", val.text, sym));
                Some(val.text)
            }
            Some(Slot::GlobalTracked { sym, created }) => {
                let val = self.as_number(f, val);
                if created || !f.at_top_level {
                    let p = f.tmp();
                    f.inst(&format!("{} = load ptr, ptr {}", p, sym));
                    self.call_runtime(
                        f,
                        RuntimeFn::TrackedUpdate,
                        &[format!("ptr {}", p), format!("double {}", val.text)],
                    );
                } else {
                    let p = self.call_runtime(
                        f,
                        RuntimeFn::TrackedCreate,
                        &[format!("double {}", val.text)],
                    );
                    f.inst(&format!("store ptr {}, ptr {}", p, sym));
                    self.mark_global_created(name);
                }
                Some(val.text)
            }
            Some(Slot::GlobalHandle { sym, kind }) => {
                let val = self.expect_kind(f, val, kind, name, loc)?;
                f.inst(&format!("store ptr {}, ptr {}", val.text, sym));
                None
            }
            None => {
                // First sight of a local. Allocas go to the entry
                // block so the storage spans the whole frame.
                let sanitized = ir::sanitize(name);
                if self.observed(name) {
                    let val = self.as_number(f, val);
                    let slot = format!("%{}.t", sanitized);
                    f.alloca(&slot, "%eigen.tracked");
                    self.call_runtime(
                        f,
                        RuntimeFn::TrackedInit,
                        &[format!("ptr {}", slot), format!("double {}", val.text)],
                    );
                    f.locals.insert(name.to_string(), Slot::Tracked { ptr: slot });
                    Some(val.text)
                } else if val.kind.is_handle() {
                    let slot = format!("%{}.slot", sanitized);
                    f.alloca(&slot, "ptr");
                    f.inst(&format!("store ptr {}, ptr {}", val.text, slot));
                    f.locals.insert(
                        name.to_string(),
                        Slot::Handle { ptr: slot, kind: val.kind },
                    );
                    None
                } else {
                    let slot = format!("%{}.slot", sanitized);
                    f.alloca(&slot, "double");
                    f.inst(&format!("store double {}, ptr {}", val.text, slot));
                    f.locals.insert(name.to_string(), Slot::Fast { ptr: slot });
                    Some(val.text)
                }
            }
        };

        // The unscoped-predicate hook: scalar assignments in a
        // tracking region feed the process-wide tracker, which is
        // what `if converged:` inside a loop reads.
        if f.tracks {
            if let Some(text) = tracked_value {
                self.call_runtime(f, RuntimeFn::TrackValue, &[format!("double {}", text)]);
            }
        }
        Ok(())
    }

    fn emit_if(
        &mut self,
        f: &mut FuncState,
        cond: &Expr,
        then: &[Stmt],
        otherwise: &[Stmt],
        loc: SourceLoc,
    ) -> Result<()> {
        let test = self.truth(f, cond, loc)?;
        let then_label = f.label("then");
        let else_label = f.label("else");
        let end_label = f.label("endif");
        let false_target = if otherwise.is_empty() { &end_label } else { &else_label };
        f.term(&format!(
            "br i1 {}, label %{}, label %{}",
            test, then_label, false_target
        ));

        f.begin_block(&then_label);
        for stmt in then {
            self.emit_stmt(f, stmt)?;
        }
        f.term(&format!("br label %{}", end_label));

        if !otherwise.is_empty() {
            f.begin_block(&else_label);
            for stmt in otherwise {
                self.emit_stmt(f, stmt)?;
            }
            f.term(&format!("br label %{}", end_label));
        }
        f.begin_block(&end_label);
        Ok(())
    }

    fn emit_while(
        &mut self,
        f: &mut FuncState,
        cond: &Expr,
        body: &[Stmt],
        loc: SourceLoc,
    ) -> Result<()> {
        let head = f.label("loop.head");
        let body_label = f.label("loop.body");
        let end = f.label("loop.end");

        f.begin_block(&head);
        let test = self.truth(f, cond, loc)?;
        f.term(&format!(
            "br i1 {}, label %{}, label %{}",
            test, body_label, end
        ));

        f.begin_block(&body_label);
        f.loops.push(LoopLabels { cont: head.clone(), brk: end.clone() });
        for stmt in body {
            self.emit_stmt(f, stmt)?;
        }
        f.loops.pop();
        f.term(&format!("br label %{}", head));

        f.begin_block(&end);
        Ok(())
    }

    fn emit_for_in(
        &mut self,
        f: &mut FuncState,
        name: &str,
        iter: &Expr,
        body: &[Stmt],
        loc: SourceLoc,
    ) -> Result<()> {
        let list = self.eval(f, iter, loc)?;
        if list.kind != Kind::List {
            return Err(Error::Compile(
                Diagnostic::new(format!(
                    "for-in iterates lists, found {}",
                    list.kind.name()
                ))
                .at(loc),
            ));
        }
        let len = self.call_runtime(f, RuntimeFn::ListLength, &[format!("ptr {}", list.text)]);

        // Loop variables bound here use an index slot plus a per
        // iteration element read.
        let idx_slot = format!("%{}", f.label("for.idx"));
        f.alloca(&idx_slot, "i64");
        f.inst(&format!("store i64 0, ptr {}", idx_slot));

        // The binding must exist before the loop so iterations update
        // one slot instead of re-creating it.
        if self.slot_of(f, name).is_none() {
            self.assign(f, name, Val::imm(0.0), loc)?;
        }

        let head = f.label("for.head");
        let body_label = f.label("for.body");
        let latch = f.label("for.latch");
        let end = f.label("for.end");

        f.begin_block(&head);
        let idx = f.tmp();
        f.inst(&format!("{} = load i64, ptr {}", idx, idx_slot));
        let cmp = f.tmp();
        f.inst(&format!("{} = icmp slt i64 {}, {}", cmp, idx, len));
        f.term(&format!(
            "br i1 {}, label %{}, label %{}",
            cmp, body_label, end
        ));

        f.begin_block(&body_label);
        let elem = self.call_runtime(
            f,
            RuntimeFn::ListGet,
            &[format!("ptr {}", list.text), format!("i64 {}", idx)],
        );
        self.assign(f, name, Val::num(elem), loc)?;
        f.loops.push(LoopLabels { cont: latch.clone(), brk: end.clone() });
        for stmt in body {
            self.emit_stmt(f, stmt)?;
        }
        f.loops.pop();
        f.term(&format!("br label %{}", latch));

        f.begin_block(&latch);
        let next = f.tmp();
        f.inst(&format!("{} = add i64 {}, 1", next, idx));
        f.inst(&format!("store i64 {}, ptr {}", next, idx_slot));
        f.term(&format!("br label %{}", head));

        f.begin_block(&end);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions

    fn eval(&mut self, f: &mut FuncState, e: &Expr, loc: SourceLoc) -> Result<Val> {
        match e {
            Expr::Number(v) => Ok(Val::imm(*v)),
            Expr::Bool(b) => Ok(Val::imm(if *b { 1.0 } else { 0.0 })),
            Expr::Null => Ok(Val::imm(0.0)),
            Expr::Str(text) => Ok(self.string_literal(f, text)),
            Expr::Id(name) => self.read_name(f, name, loc),
            Expr::List(items) => self.eval_list(f, items, loc),
            Expr::Binary(op, l, r) => self.eval_binary(f, *op, l, r, loc),
            Expr::Unary(op, x) => self.eval_unary(f, *op, x, loc),
            Expr::Call(name, args) => self.eval_call(f, name, args, loc),
            Expr::Index(target, idx) => self.eval_index(f, target, idx, loc),
            Expr::Slice(target, start, end) => self.eval_slice(f, target, start, end, loc),
            Expr::Question(kind, name) => self.eval_question(f, *kind, name, loc),
            Expr::Predicate(kind, target) => self.eval_predicate(f, *kind, target.as_deref(), loc),
        }
    }

    fn slot_of(&self, f: &FuncState, name: &str) -> Option<Slot> {
        f.locals
            .get(name)
            .or_else(|| self.global_slots.get(name))
            .cloned()
    }

    fn mark_global_created(&mut self, name: &str) {
        if let Some(Slot::GlobalTracked { created, .. }) = self.global_slots.get_mut(name) {
            *created = true;
        }
    }

    fn read_name(&mut self, f: &mut FuncState, name: &str, _loc: SourceLoc) -> Result<Val> {
        match self.slot_of(f, name) {
            Some(Slot::Fast { ptr }) => {
                let out = f.tmp();
                f.inst(&format!("{} = load double, ptr {}", out, ptr));
                Ok(Val::num(out))
            }
            Some(Slot::Tracked { ptr }) => {
                let out =
                    self.call_runtime(f, RuntimeFn::TrackedValue, &[format!("ptr {}", ptr)]);
                Ok(Val::num(out))
            }
            Some(Slot::Handle { ptr, kind }) => {
                let out = f.tmp();
                f.inst(&format!("{} = load ptr, ptr {}", out, ptr));
                Ok(Val::handle(out, kind))
            }
            Some(Slot::GlobalFast { sym }) => {
                let out = f.tmp();
                f.inst(&format!("{} = load double, ptr {}", out, sym));
                Ok(Val::num(out))
            }
            Some(Slot::GlobalTracked { sym, .. }) => {
                let p = f.tmp();
                f.inst(&format!("{} = load ptr, ptr {}", p, sym));
                let out = self.call_runtime(f, RuntimeFn::TrackedValue, &[format!("ptr {}", p)]);
                Ok(Val::num(out))
            }
            Some(Slot::GlobalHandle { sym, kind }) => {
                let out = f.tmp();
                f.inst(&format!("{} = load ptr, ptr {}", out, sym));
                Ok(Val::handle(out, kind))
            }
            None => {
                // Not bound anywhere in this module: treat it as a
                // cross-module global holding a raw double.
                self.external_globals.insert(name.to_string());
                let out = f.tmp();
                f.inst(&format!(
                    "{} = load double, ptr {}",
                    out,
                    ir::global_symbol(name)
                ));
                Ok(Val::num(out))
            }
        }
    }

    fn eval_list(&mut self, f: &mut FuncState, items: &[Expr], loc: SourceLoc) -> Result<Val> {
        let list = self.call_runtime(
            f,
            RuntimeFn::ListCreate,
            &[format!("i64 {}", items.len())],
        );
        for (i, item) in items.iter().enumerate() {
            let v = self.eval(f, item, loc)?;
            let v = self.as_number(f, v);
            self.call_runtime(
                f,
                RuntimeFn::ListSet,
                &[
                    format!("ptr {}", list),
                    format!("i64 {}", i),
                    format!("double {}", v.text),
                ],
            );
        }
        Ok(Val::handle(list, Kind::List))
    }

    fn eval_binary(
        &mut self,
        f: &mut FuncState,
        op: BinOp,
        l: &Expr,
        r: &Expr,
        loc: SourceLoc,
    ) -> Result<Val> {
        if matches!(op, BinOp::And | BinOp::Or) {
            return self.eval_short_circuit(f, op, l, r, loc);
        }
        let lhs = self.eval(f, l, loc)?;
        let rhs = self.eval(f, r, loc)?;

        // String equality routes through the runtime; everything
        // else is double arithmetic.
        if lhs.kind == Kind::Str && rhs.kind == Kind::Str && matches!(op, BinOp::Eq | BinOp::Neq) {
            let eq = self.call_runtime(
                f,
                RuntimeFn::StringEquals,
                &[format!("ptr {}", lhs.text), format!("ptr {}", rhs.text)],
            );
            let as_num = f.tmp();
            f.inst(&format!("{} = sitofp i64 {} to double", as_num, eq));
            if op == BinOp::Eq {
                return Ok(Val::num(as_num));
            }
            let flipped = f.tmp();
            f.inst(&format!(
                "{} = fsub double {}, {}",
                flipped,
                ir::double_constant(1.0),
                as_num
            ));
            return Ok(Val::num(flipped));
        }

        let lhs = self.expect_operand(f, lhs, op, loc)?;
        let rhs = self.expect_operand(f, rhs, op, loc)?;
        let out = f.tmp();
        match op {
            BinOp::Add => f.inst(&format!("{} = fadd double {}, {}", out, lhs.text, rhs.text)),
            BinOp::Sub => f.inst(&format!("{} = fsub double {}, {}", out, lhs.text, rhs.text)),
            BinOp::Mul => f.inst(&format!("{} = fmul double {}, {}", out, lhs.text, rhs.text)),
            BinOp::Div => f.inst(&format!("{} = fdiv double {}, {}", out, lhs.text, rhs.text)),
            BinOp::Mod => f.inst(&format!("{} = frem double {}, {}", out, lhs.text, rhs.text)),
            BinOp::Lt | BinOp::Gt | BinOp::Lte | BinOp::Gte | BinOp::Eq | BinOp::Neq => {
                let cc = match op {
                    BinOp::Lt => "olt",
                    BinOp::Gt => "ogt",
                    BinOp::Lte => "ole",
                    BinOp::Gte => "oge",
                    BinOp::Eq => "oeq",
                    _ => "one",
                };
                f.inst(&format!(
                    "{} = fcmp {} double {}, {}",
                    out, cc, lhs.text, rhs.text
                ));
                let widened = f.tmp();
                f.inst(&format!("{} = uitofp i1 {} to double", widened, out));
                return Ok(Val::num(widened));
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
        Ok(Val::num(out))
    }

    // `and`/`or` short-circuit through basic blocks; the result is
    // canonicalized to 0.0/1.0 in a scratch slot.
    fn eval_short_circuit(
        &mut self,
        f: &mut FuncState,
        op: BinOp,
        l: &Expr,
        r: &Expr,
        loc: SourceLoc,
    ) -> Result<Val> {
        let slot = format!("%{}", f.label("logic.slot"));
        f.alloca(&slot, "double");
        let rhs_label = f.label("logic.rhs");
        let short_label = f.label("logic.short");
        let end_label = f.label("logic.end");

        let test = self.truth(f, l, loc)?;
        let (on_true, on_false) = match op {
            BinOp::And => (rhs_label.as_str(), short_label.as_str()),
            _ => (short_label.as_str(), rhs_label.as_str()),
        };
        f.term(&format!(
            "br i1 {}, label %{}, label %{}",
            test, on_true, on_false
        ));

        f.begin_block(&short_label);
        let short_value = if op == BinOp::And { 0.0 } else { 1.0 };
        f.inst(&format!(
            "store double {}, ptr {}",
            ir::double_constant(short_value),
            slot
        ));
        f.term(&format!("br label %{}", end_label));

        f.begin_block(&rhs_label);
        let rhs_test = self.truth(f, r, loc)?;
        let widened = f.tmp();
        f.inst(&format!("{} = uitofp i1 {} to double", widened, rhs_test));
        f.inst(&format!("store double {}, ptr {}", widened, slot));
        f.term(&format!("br label %{}", end_label));

        f.begin_block(&end_label);
        let out = f.tmp();
        f.inst(&format!("{} = load double, ptr {}", out, slot));
        Ok(Val::num(out))
    }

    fn eval_unary(&mut self, f: &mut FuncState, op: UnOp, x: &Expr, loc: SourceLoc) -> Result<Val> {
        match op {
            UnOp::Not => {
                let v = self.eval(f, x, loc)?;
                let v = self.as_number(f, v);
                let cmp = f.tmp();
                f.inst(&format!(
                    "{} = fcmp oeq double {}, {}",
                    cmp,
                    v.text,
                    ir::double_constant(0.0)
                ));
                let out = f.tmp();
                f.inst(&format!("{} = uitofp i1 {} to double", out, cmp));
                Ok(Val::num(out))
            }
            UnOp::Neg => {
                let v = self.eval(f, x, loc)?;
                let v = self.expect_operand(f, v, BinOp::Sub, loc)?;
                let out = f.tmp();
                f.inst(&format!("{} = fneg double {}", out, v.text));
                Ok(Val::num(out))
            }
        }
    }

    fn eval_index(
        &mut self,
        f: &mut FuncState,
        target: &Expr,
        idx: &Expr,
        loc: SourceLoc,
    ) -> Result<Val> {
        let base = self.eval(f, target, loc)?;
        let index = self.eval(f, idx, loc)?;
        let index = self.as_number(f, index);
        let index = self.to_i64(f, &index);
        match base.kind {
            Kind::List => {
                let out = self.call_runtime(
                    f,
                    RuntimeFn::ListGet,
                    &[format!("ptr {}", base.text), format!("i64 {}", index)],
                );
                Ok(Val::num(out))
            }
            Kind::Str => {
                let code = self.call_runtime(
                    f,
                    RuntimeFn::StringCharAt,
                    &[format!("ptr {}", base.text), format!("i64 {}", index)],
                );
                let out = f.tmp();
                f.inst(&format!("{} = sitofp i64 {} to double", out, code));
                Ok(Val::num(out))
            }
            kind => Err(Error::Compile(
                Diagnostic::new(format!("cannot index a {}", kind.name())).at(loc),
            )),
        }
    }

    fn eval_slice(
        &mut self,
        f: &mut FuncState,
        target: &Expr,
        start: &Expr,
        end: &Expr,
        loc: SourceLoc,
    ) -> Result<Val> {
        let base = self.eval(f, target, loc)?;
        let start = self.eval(f, start, loc)?;
        let start = self.as_number(f, start);
        let end = self.eval(f, end, loc)?;
        let end = self.as_number(f, end);
        match base.kind {
            Kind::List => {
                let s = self.to_i64(f, &start);
                let e = self.to_i64(f, &end);
                let out = self.call_runtime(
                    f,
                    RuntimeFn::ListSlice,
                    &[
                        format!("ptr {}", base.text),
                        format!("i64 {}", s),
                        format!("i64 {}", e),
                    ],
                );
                Ok(Val::handle(out, Kind::List))
            }
            Kind::Str => {
                // The runtime takes (start, length).
                let span = f.tmp();
                f.inst(&format!(
                    "{} = fsub double {}, {}",
                    span, end.text, start.text
                ));
                let s = self.to_i64(f, &start);
                let n = self.to_i64(f, &Val::num(span));
                let out = self.call_runtime(
                    f,
                    RuntimeFn::StringSubstring,
                    &[
                        format!("ptr {}", base.text),
                        format!("i64 {}", s),
                        format!("i64 {}", n),
                    ],
                );
                Ok(Val::handle(out, Kind::Str))
            }
            kind => Err(Error::Compile(
                Diagnostic::new(format!("cannot slice a {}", kind.name())).at(loc),
            )),
        }
    }

    fn eval_question(
        &mut self,
        f: &mut FuncState,
        kind: QuestionKind,
        name: &str,
        loc: SourceLoc,
    ) -> Result<Val> {
        let tracked_ptr = match self.slot_of(f, name) {
            Some(Slot::Tracked { ptr }) => Some(ptr),
            Some(Slot::GlobalTracked { sym, .. }) => {
                let p = f.tmp();
                f.inst(&format!("{} = load ptr, ptr {}", p, sym));
                Some(p)
            }
            Some(_) => None,
            None => {
                return Err(Error::Compile(
                    Diagnostic::new(format!("interrogative over unknown name `{}`", name)).at(loc),
                ))
            }
        };

        match (tracked_ptr, kind) {
            (Some(p), QuestionKind::What) => {
                let out = self.call_runtime(f, RuntimeFn::TrackedValue, &[format!("ptr {}", p)]);
                Ok(Val::num(out))
            }
            (Some(p), QuestionKind::Why) => {
                let out =
                    self.call_runtime(f, RuntimeFn::TrackedGradient, &[format!("ptr {}", p)]);
                Ok(Val::num(out))
            }
            (Some(p), QuestionKind::How) => {
                let out =
                    self.call_runtime(f, RuntimeFn::TrackedStability, &[format!("ptr {}", p)]);
                Ok(Val::num(out))
            }
            (Some(p), QuestionKind::When) => {
                let iter =
                    self.call_runtime(f, RuntimeFn::TrackedIteration, &[format!("ptr {}", p)]);
                let out = f.tmp();
                f.inst(&format!("{} = sitofp i64 {} to double", out, iter));
                Ok(Val::num(out))
            }
            (Some(p), QuestionKind::Who) => {
                let bits = f.tmp();
                f.inst(&format!("{} = ptrtoint ptr {} to i64", bits, p));
                Ok(self.identity_hash(f, bits))
            }
            (None, QuestionKind::What) => self.read_name(f, name, loc),
            (None, QuestionKind::Who) => {
                let v = self.read_name(f, name, loc)?;
                let v = self.as_number(f, v);
                let bits = f.tmp();
                f.inst(&format!("{} = bitcast double {} to i64", bits, v.text));
                Ok(self.identity_hash(f, bits))
            }
            // An untracked binding has no geometry: gradient reads 0,
            // stability reads 1, the clock reads 0.
            (None, QuestionKind::Why) => Ok(Val::imm(0.0)),
            (None, QuestionKind::How) => Ok(Val::imm(1.0)),
            (None, QuestionKind::When) => Ok(Val::imm(0.0)),
            // Reserved.
            (_, QuestionKind::Where) => Ok(Val::imm(0.0)),
        }
    }

    // Low 32 bits of bits ^ (bits >> 32), as a double.
    fn identity_hash(&mut self, f: &mut FuncState, bits: String) -> Val {
        let hi = f.tmp();
        f.inst(&format!("{} = lshr i64 {}, 32", hi, bits));
        let mixed = f.tmp();
        f.inst(&format!("{} = xor i64 {}, {}", mixed, bits, hi));
        let low = f.tmp();
        f.inst(&format!("{} = and i64 {}, 4294967295", low, mixed));
        let out = f.tmp();
        f.inst(&format!("{} = uitofp i64 {} to double", out, low));
        Val::num(out)
    }

    fn eval_predicate(
        &mut self,
        f: &mut FuncState,
        kind: PredicateKind,
        target: Option<&str>,
        loc: SourceLoc,
    ) -> Result<Val> {
        // Scoped predicates in the convergence family read the
        // variable's own history. Everything else, and every
        // unscoped use, reads the process-wide tracker.
        if let Some(name) = target {
            let check = match kind {
                PredicateKind::Converged => Some(RuntimeFn::CheckConverged),
                PredicateKind::Diverging => Some(RuntimeFn::CheckDiverging),
                PredicateKind::Oscillating => Some(RuntimeFn::CheckOscillating),
                PredicateKind::Stable => Some(RuntimeFn::CheckStable),
                PredicateKind::Improving => Some(RuntimeFn::CheckImproving),
                _ => None,
            };
            if let Some(check) = check {
                let ptr = match self.slot_of(f, name) {
                    Some(Slot::Tracked { ptr }) => ptr,
                    Some(Slot::GlobalTracked { sym, .. }) => {
                        let p = f.tmp();
                        f.inst(&format!("{} = load ptr, ptr {}", p, sym));
                        p
                    }
                    Some(_) => {
                        return Err(Error::Compile(
                            Diagnostic::new(format!(
                                "predicate over `{}`, which is not observed",
                                name
                            ))
                            .at(loc)
                            .hint("the resolver promotes predicate targets; was this tree resolved?"),
                        ))
                    }
                    None => {
                        return Err(Error::Compile(
                            Diagnostic::new(format!("predicate over unknown name `{}`", name))
                                .at(loc),
                        ))
                    }
                };
                let out = self.call_runtime(f, check, &[format!("ptr {}", ptr)]);
                return Ok(Val::num(out));
            }
        }

        let global = match kind {
            PredicateKind::Converged => RuntimeFn::IsConverged,
            PredicateKind::Stable => RuntimeFn::IsStable,
            PredicateKind::Diverging => RuntimeFn::IsDiverging,
            PredicateKind::Oscillating => RuntimeFn::IsOscillating,
            PredicateKind::Improving => RuntimeFn::IsImproving,
            PredicateKind::Equilibrium => RuntimeFn::IsEquilibrium,
            PredicateKind::Stuck => RuntimeFn::IsStuck,
            PredicateKind::Chaotic => RuntimeFn::IsChaotic,
            PredicateKind::Settled => RuntimeFn::IsSettled,
            PredicateKind::Balanced => RuntimeFn::IsBalanced,
        };
        let out = self.call_runtime(f, global, &[]);
        Ok(Val::num(out))
    }

    // ------------------------------------------------------------------
    // Calls

    fn eval_call(
        &mut self,
        f: &mut FuncState,
        name: &str,
        args: &[Expr],
        loc: SourceLoc,
    ) -> Result<Val> {
        if let Some(result) = self.eval_builtin(f, name, args, loc)? {
            return Ok(result);
        }

        // User function: all parameters are doubles; handles cross as
        // encoded doubles.
        match self.functions.get(name) {
            Some(&arity) if arity != args.len() => {
                return Err(Error::Compile(
                    Diagnostic::new(format!(
                        "`{}` takes {} argument(s), got {}",
                        name,
                        arity,
                        args.len()
                    ))
                    .at(loc),
                ));
            }
            Some(_) => {}
            None => {
                self.external_fns.insert(name.to_string(), args.len());
            }
        }

        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.eval(f, arg, loc)?;
            let v = self.as_number(f, v);
            rendered.push(format!("double {}", v.text));
        }
        let out = f.tmp();
        f.inst(&format!(
            "{} = call double {}({})",
            out,
            ir::function_symbol(&self.opts.module_name, name),
            rendered.join(", ")
        ));
        Ok(Val::num(out))
    }

    // The builtin namespace: calls every program gets without
    // defining anything. Returns Ok(None) when `name` is not a
    // builtin.
    fn eval_builtin(
        &mut self,
        f: &mut FuncState,
        name: &str,
        args: &[Expr],
        loc: SourceLoc,
    ) -> Result<Option<Val>> {
        use RuntimeFn::*;

        // Unary math forwards all share one shape.
        let math = |name: &str| -> Option<RuntimeFn> {
            match name {
                "sqrt" => Some(Sqrt),
                "abs" => Some(Abs),
                "log" => Some(Log),
                "exp" => Some(Exp),
                "sin" => Some(Sin),
                "cos" => Some(Cos),
                "tan" => Some(Tan),
                "floor" => Some(Floor),
                "ceil" => Some(Ceil),
                "round" => Some(Round),
                _ => None,
            }
        };
        if let Some(func) = math(name) {
            let v = self.nth_number(f, args, 0, name, loc)?;
            let out = self.call_runtime(f, func, &[format!("double {}", v.text)]);
            return Ok(Some(Val::num(out)));
        }

        let result = match name {
            "print" => {
                let v = self.eval_nth(f, args, 0, name, loc)?;
                let v = self.as_number(f, v);
                self.call_runtime(f, PrintVal, &[format!("double {}", v.text)]);
                Val::imm(0.0)
            }
            "print_newline" => {
                self.expect_arity(args, 0, name, loc)?;
                self.call_runtime(f, PrintNewline, &[]);
                Val::imm(0.0)
            }
            "pow" => {
                let base = self.nth_number(f, args, 0, name, loc)?;
                let exponent = self.nth_number(f, args, 1, name, loc)?;
                let out = self.call_runtime(
                    f,
                    Pow,
                    &[
                        format!("double {}", base.text),
                        format!("double {}", exponent.text),
                    ],
                );
                Val::num(out)
            }
            "length" => {
                let v = self.eval_nth(f, args, 0, name, loc)?;
                let func = match v.kind {
                    Kind::List => ListLength,
                    Kind::Str => StringLength,
                    kind => {
                        return Err(Error::Compile(
                            Diagnostic::new(format!("length of a {}", kind.name())).at(loc),
                        ))
                    }
                };
                let n = self.call_runtime(f, func, &[format!("ptr {}", v.text)]);
                let out = f.tmp();
                f.inst(&format!("{} = sitofp i64 {} to double", out, n));
                Val::num(out)
            }
            "append" => {
                let list = self.nth_handle(f, args, 0, Kind::List, name, loc)?;
                let v = self.nth_number(f, args, 1, name, loc)?;
                self.call_runtime(
                    f,
                    ListAppend,
                    &[format!("ptr {}", list.text), format!("double {}", v.text)],
                );
                Val::imm(0.0)
            }
            "to_string" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                let out = self.call_runtime(f, NumberToString, &[format!("double {}", v.text)]);
                Val::handle(out, Kind::Str)
            }
            "to_number" => {
                let s = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let out = self.call_runtime(f, StringToNumber, &[format!("ptr {}", s.text)]);
                Val::num(out)
            }
            "char_to_string" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                let out = self.call_runtime(f, CharToString, &[format!("double {}", v.text)]);
                Val::handle(out, Kind::Str)
            }
            "char_at" => {
                let s = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let i = self.nth_number(f, args, 1, name, loc)?;
                let i = self.to_i64(f, &i);
                let code = self.call_runtime(
                    f,
                    StringCharAt,
                    &[format!("ptr {}", s.text), format!("i64 {}", i)],
                );
                let out = f.tmp();
                f.inst(&format!("{} = sitofp i64 {} to double", out, code));
                Val::num(out)
            }
            "substring" => {
                let s = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let start = self.nth_number(f, args, 1, name, loc)?;
                let len = self.nth_number(f, args, 2, name, loc)?;
                let start = self.to_i64(f, &start);
                let len = self.to_i64(f, &len);
                let out = self.call_runtime(
                    f,
                    StringSubstring,
                    &[
                        format!("ptr {}", s.text),
                        format!("i64 {}", start),
                        format!("i64 {}", len),
                    ],
                );
                Val::handle(out, Kind::Str)
            }
            "concat" => {
                let a = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let b = self.nth_handle(f, args, 1, Kind::Str, name, loc)?;
                let out = self.call_runtime(
                    f,
                    StringConcat,
                    &[format!("ptr {}", a.text), format!("ptr {}", b.text)],
                );
                Val::handle(out, Kind::Str)
            }
            "compare" => {
                let a = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let b = self.nth_handle(f, args, 1, Kind::Str, name, loc)?;
                let c = self.call_runtime(
                    f,
                    StringCompare,
                    &[format!("ptr {}", a.text), format!("ptr {}", b.text)],
                );
                let out = f.tmp();
                f.inst(&format!("{} = sitofp i64 {} to double", out, c));
                Val::num(out)
            }
            "find" => {
                let hay = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let needle = self.nth_handle(f, args, 1, Kind::Str, name, loc)?;
                let start = if args.len() > 2 {
                    let v = self.nth_number(f, args, 2, name, loc)?;
                    self.to_i64(f, &v)
                } else {
                    String::from("0")
                };
                let found = self.call_runtime(
                    f,
                    StringFind,
                    &[
                        format!("ptr {}", hay.text),
                        format!("ptr {}", needle.text),
                        format!("i64 {}", start),
                    ],
                );
                let out = f.tmp();
                f.inst(&format!("{} = sitofp i64 {} to double", out, found));
                Val::num(out)
            }
            "is_digit" | "is_alpha" | "is_alnum" | "is_whitespace" | "is_newline" => {
                let func = match name {
                    "is_digit" => IsDigit,
                    "is_alpha" => IsAlpha,
                    "is_alnum" => IsAlnum,
                    "is_whitespace" => IsWhitespace,
                    _ => IsNewline,
                };
                let v = self.nth_number(f, args, 0, name, loc)?;
                let out = self.call_runtime(f, func, &[format!("double {}", v.text)]);
                Val::num(out)
            }
            "file_read" => {
                let path = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let out = self.call_runtime(f, FileRead, &[format!("ptr {}", path.text)]);
                Val::handle(out, Kind::Str)
            }
            "file_write" | "file_append" => {
                let func = if name == "file_write" { FileWrite } else { FileAppend };
                let path = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let content = self.nth_handle(f, args, 1, Kind::Str, name, loc)?;
                let out = self.call_runtime(
                    f,
                    func,
                    &[format!("ptr {}", path.text), format!("ptr {}", content.text)],
                );
                Val::num(out)
            }
            "file_exists" => {
                let path = self.nth_handle(f, args, 0, Kind::Str, name, loc)?;
                let out = self.call_runtime(f, FileExists, &[format!("ptr {}", path.text)]);
                Val::num(out)
            }
            "argc" => {
                self.expect_arity(args, 0, name, loc)?;
                let out = self.call_runtime(f, GetArgc, &[]);
                Val::num(out)
            }
            "arg" => {
                let i = self.nth_number(f, args, 0, name, loc)?;
                let encoded = self.call_runtime(f, GetArg, &[format!("double {}", i.text)]);
                // Known to be an encoded string; recover the typed
                // pointer for the in-module fast path.
                let bits = f.tmp();
                f.inst(&format!("{} = bitcast double {} to i64", bits, encoded));
                let p = f.tmp();
                f.inst(&format!("{} = inttoptr i64 {} to ptr", p, bits));
                Val::handle(p, Kind::Str)
            }
            "zeros" | "ones" | "random_matrix" => {
                let func = match name {
                    "zeros" => MatrixZeros,
                    "ones" => MatrixOnes,
                    _ => MatrixRandom,
                };
                let r = self.nth_number(f, args, 0, name, loc)?;
                let c = self.nth_number(f, args, 1, name, loc)?;
                let r = self.to_i64(f, &r);
                let c = self.to_i64(f, &c);
                let out =
                    self.call_runtime(f, func, &[format!("i64 {}", r), format!("i64 {}", c)]);
                Val::handle(out, Kind::Matrix)
            }
            "identity" => {
                let n = self.nth_number(f, args, 0, name, loc)?;
                let n = self.to_i64(f, &n);
                let out = self.call_runtime(f, MatrixIdentity, &[format!("i64 {}", n)]);
                Val::handle(out, Kind::Matrix)
            }
            "seed_random" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                let s = f.tmp();
                f.inst(&format!("{} = fptoui double {} to i64", s, v.text));
                self.call_runtime(f, MatrixSeed, &[format!("i64 {}", s)]);
                Val::imm(0.0)
            }
            "shape" => {
                let m = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let out = self.call_runtime(f, MatrixShape, &[format!("ptr {}", m.text)]);
                Val::handle(out, Kind::List)
            }
            "transpose" => {
                let m = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let out = self.call_runtime(f, MatrixTranspose, &[format!("ptr {}", m.text)]);
                Val::handle(out, Kind::Matrix)
            }
            "matmul" | "matrix_add" | "matrix_concat" => {
                let func = match name {
                    "matmul" => MatrixMatmul,
                    "matrix_add" => MatrixAdd,
                    _ => MatrixConcat,
                };
                let a = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let b = self.nth_handle(f, args, 1, Kind::Matrix, name, loc)?;
                let out = self.call_runtime(
                    f,
                    func,
                    &[format!("ptr {}", a.text), format!("ptr {}", b.text)],
                );
                Val::handle(out, Kind::Matrix)
            }
            "matrix_scale" => {
                let m = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let k = self.nth_number(f, args, 1, name, loc)?;
                let out = self.call_runtime(
                    f,
                    MatrixScale,
                    &[format!("ptr {}", m.text), format!("double {}", k.text)],
                );
                Val::handle(out, Kind::Matrix)
            }
            "matrix_sum" | "matrix_mean" => {
                let func = if name == "matrix_sum" { MatrixSum } else { MatrixMean };
                let m = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let out = self.call_runtime(f, func, &[format!("ptr {}", m.text)]);
                Val::num(out)
            }
            "reshape" | "matrix_slice" => {
                let func = if name == "reshape" { MatrixReshape } else { MatrixSlice };
                let m = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let a = self.nth_number(f, args, 1, name, loc)?;
                let b = self.nth_number(f, args, 2, name, loc)?;
                let a = self.to_i64(f, &a);
                let b = self.to_i64(f, &b);
                let out = self.call_runtime(
                    f,
                    func,
                    &[
                        format!("ptr {}", m.text),
                        format!("i64 {}", a),
                        format!("i64 {}", b),
                    ],
                );
                Val::handle(out, Kind::Matrix)
            }
            "relu" | "gelu" | "softmax" | "layer_norm" => {
                let func = match name {
                    "relu" => MatrixRelu,
                    "gelu" => MatrixGelu,
                    "softmax" => MatrixSoftmax,
                    _ => MatrixLayerNorm,
                };
                let m = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let out = self.call_runtime(f, func, &[format!("ptr {}", m.text)]);
                Val::handle(out, Kind::Matrix)
            }
            "embedding" => {
                let table = self.nth_handle(f, args, 0, Kind::Matrix, name, loc)?;
                let ids = self.nth_handle(f, args, 1, Kind::List, name, loc)?;
                let out = self.call_runtime(
                    f,
                    MatrixEmbeddingLookup,
                    &[format!("ptr {}", table.text), format!("ptr {}", ids.text)],
                );
                Val::handle(out, Kind::Matrix)
            }
            "positional_encoding" => {
                let p = self.nth_number(f, args, 0, name, loc)?;
                let d = self.nth_number(f, args, 1, name, loc)?;
                let p = self.to_i64(f, &p);
                let d = self.to_i64(f, &d);
                let out = self.call_runtime(
                    f,
                    MatrixSinusoidalPe,
                    &[format!("i64 {}", p), format!("i64 {}", d)],
                );
                Val::handle(out, Kind::Matrix)
            }
            "causal_mask" => {
                let n = self.nth_number(f, args, 0, name, loc)?;
                let n = self.to_i64(f, &n);
                let out = self.call_runtime(f, MatrixCausalMask, &[format!("i64 {}", n)]);
                Val::handle(out, Kind::Matrix)
            }
            "track_value" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                self.call_runtime(f, TrackValue, &[format!("double {}", v.text)]);
                Val::imm(0.0)
            }
            "was_is" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                let out = self.call_runtime(f, WasIs, &[format!("double {}", v.text)]);
                Val::num(out)
            }
            "change_is" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                let out = self.call_runtime(f, ChangeIs, &[format!("double {}", v.text)]);
                Val::num(out)
            }
            "trend_is" => {
                let v = self.nth_number(f, args, 0, name, loc)?;
                let out = self.call_runtime(f, TrendIs, &[format!("double {}", v.text)]);
                Val::num(out)
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    // ------------------------------------------------------------------
    // Coercions and small helpers

    // Evaluate a condition down to an i1 register.
    fn truth(&mut self, f: &mut FuncState, e: &Expr, loc: SourceLoc) -> Result<String> {
        let v = self.eval(f, e, loc)?;
        let v = self.as_number(f, v);
        let out = f.tmp();
        f.inst(&format!(
            "{} = fcmp one double {}, {}",
            out,
            v.text,
            ir::double_constant(0.0)
        ));
        Ok(out)
    }

    // Fold a value into a double: handles become encoded doubles.
    fn as_number(&mut self, f: &mut FuncState, v: Val) -> Val {
        if v.kind == Kind::Num {
            return v;
        }
        let bits = f.tmp();
        f.inst(&format!("{} = ptrtoint ptr {} to i64", bits, v.text));
        let out = f.tmp();
        f.inst(&format!("{} = bitcast i64 {} to double", out, bits));
        Val::num(out)
    }

    fn to_i64(&mut self, f: &mut FuncState, v: &Val) -> String {
        let out = f.tmp();
        f.inst(&format!("{} = fptosi double {} to i64", out, v.text));
        out
    }

    fn expect_kind(
        &mut self,
        f: &mut FuncState,
        v: Val,
        want: Kind,
        name: &str,
        loc: SourceLoc,
    ) -> Result<Val> {
        if v.kind == want {
            return Ok(v);
        }
        // A handle flowing into a double-shaped slot crosses the
        // bridge; anything else is a kind clash.
        if want == Kind::Num {
            return Ok(self.as_number(f, v));
        }
        Err(Error::Compile(
            Diagnostic::new(format!(
                "`{}` holds a {}, assigned a {}",
                name,
                want.name(),
                v.kind.name()
            ))
            .at(loc),
        ))
    }

    fn expect_operand(
        &mut self,
        _f: &mut FuncState,
        v: Val,
        op: BinOp,
        loc: SourceLoc,
    ) -> Result<Val> {
        if v.kind == Kind::Num {
            return Ok(v);
        }
        Err(Error::Compile(
            Diagnostic::new(format!(
                "operator {:?} needs numbers, found a {}",
                op,
                v.kind.name()
            ))
            .at(loc),
        ))
    }

    fn expect_arity(&self, args: &[Expr], want: usize, name: &str, loc: SourceLoc) -> Result<()> {
        if args.len() == want {
            Ok(())
        } else {
            Err(Error::Compile(
                Diagnostic::new(format!(
                    "`{}` takes {} argument(s), got {}",
                    name,
                    want,
                    args.len()
                ))
                .at(loc),
            ))
        }
    }

    fn eval_nth(
        &mut self,
        f: &mut FuncState,
        args: &[Expr],
        n: usize,
        name: &str,
        loc: SourceLoc,
    ) -> Result<Val> {
        let arg = args.get(n).ok_or_else(|| {
            Error::Compile(
                Diagnostic::new(format!("`{}` is missing argument {}", name, n + 1)).at(loc),
            )
        })?;
        self.eval(f, arg, loc)
    }

    fn nth_number(
        &mut self,
        f: &mut FuncState,
        args: &[Expr],
        n: usize,
        name: &str,
        loc: SourceLoc,
    ) -> Result<Val> {
        let v = self.eval_nth(f, args, n, name, loc)?;
        Ok(self.as_number(f, v))
    }

    fn nth_handle(
        &mut self,
        f: &mut FuncState,
        args: &[Expr],
        n: usize,
        want: Kind,
        name: &str,
        loc: SourceLoc,
    ) -> Result<Val> {
        let v = self.eval_nth(f, args, n, name, loc)?;
        if v.kind != want {
            return Err(Error::Compile(
                Diagnostic::new(format!(
                    "`{}` wants a {} for argument {}, found a {}",
                    name,
                    want.name(),
                    n + 1,
                    v.kind.name()
                ))
                .at(loc),
            ));
        }
        Ok(v)
    }

    // ------------------------------------------------------------------
    // String literals

    // Literals are deduplicated per module. Each gets a private
    // constant plus a cache slot; the first use boxes the bytes into
    // a runtime string and later uses reload the cached handle.
    fn string_literal(&mut self, f: &mut FuncState, text: &str) -> Val {
        let id = match self.string_ids.get(text) {
            Some(&id) => id,
            None => {
                let id = self.string_ids.len();
                self.string_ids.insert(text.to_string(), id);
                let bytes = text.as_bytes();
                let _ = writeln!(
                    self.strings,
                    "@.str.{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
                    id,
                    bytes.len() + 1,
                    ir::escape_bytes(bytes)
                );
                let _ = writeln!(self.strings, "@.str.{}.boxed = internal global ptr null", id);
                id
            }
        };

        let cached = f.tmp();
        f.inst(&format!("{} = load ptr, ptr @.str.{}.boxed", cached, id));
        let is_null = f.tmp();
        f.inst(&format!("{} = icmp eq ptr {}, null", is_null, cached));
        let init = f.label("str.init");
        let done = f.label("str.done");
        f.term(&format!(
            "br i1 {}, label %{}, label %{}",
            is_null, init, done
        ));

        f.begin_block(&init);
        let raw = f.tmp();
        f.inst(&format!(
            "{} = getelementptr inbounds [{} x i8], ptr @.str.{}, i64 0, i64 0",
            raw,
            text.len() + 1,
            id
        ));
        let boxed = self.call_runtime(f, RuntimeFn::StringFromCstr, &[format!("ptr {}", raw)]);
        f.inst(&format!("store ptr {}, ptr @.str.{}.boxed", boxed, id));
        f.term(&format!("br label %{}", done));

        f.begin_block(&done);
        let out = f.tmp();
        f.inst(&format!("{} = load ptr, ptr @.str.{}.boxed", out, id));
        Val::handle(out, Kind::Str)
    }

    // ------------------------------------------------------------------
    // Final assembly

    fn assemble(&mut self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; ModuleID = '{}'", self.opts.module_name);
        let _ = writeln!(out, "source_filename = \"{}\"", self.opts.module_name);
        let _ = writeln!(out, "target triple = \"{}\"", self.opts.target_triple);
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", ir::TRACKED_TYPEDEF);
        let _ = writeln!(out);
        if !self.strings.is_empty() {
            out.push_str(&self.strings);
            let _ = writeln!(out);
        }
        if !self.globals.is_empty() {
            out.push_str(&self.globals);
            let _ = writeln!(out);
        }
        for name in &self.external_globals {
            // Defined by some other module; see the cross-module
            // global scheme.
            let _ = writeln!(out, "{} = external global double", ir::global_symbol(name));
        }
        if !self.external_globals.is_empty() {
            let _ = writeln!(out);
        }
        out.push_str(&self.funcs);

        for module in &self.imports {
            let _ = writeln!(out, "declare void {}()", ir::init_symbol(module));
        }
        for (name, arity) in &self.external_fns {
            let params = vec!["double"; *arity].join(", ");
            let _ = writeln!(
                out,
                "declare double {}({})",
                ir::function_symbol(&self.opts.module_name, name),
                params
            );
        }

        let decls: Vec<RuntimeFn> = self.decls.iter().copied().collect();
        for func in decls {
            let group = self.attr_group(func.attrs());
            let _ = writeln!(out, "{}", func.declaration(group));
        }
        let _ = writeln!(out);
        for (i, set) in self.attr_groups.iter().enumerate() {
            let _ = writeln!(out, "attributes #{} = {{ {} }}", i, ir::render_attrs(*set));
        }
        out
    }
}

// ----------------------------------------------------------------------
// Tree scans

// Builtins whose results are handles rather than numbers.
fn builtin_return_kind(name: &str) -> Option<Kind> {
    match name {
        "to_string" | "char_to_string" | "concat" | "substring" | "file_read" | "arg" => {
            Some(Kind::Str)
        }
        "shape" => Some(Kind::List),
        "zeros" | "ones" | "identity" | "random_matrix" | "transpose" | "matmul"
        | "matrix_add" | "matrix_scale" | "matrix_concat" | "reshape" | "matrix_slice"
        | "relu" | "gelu" | "softmax" | "layer_norm" | "embedding" | "positional_encoding"
        | "causal_mask" => Some(Kind::Matrix),
        _ => None,
    }
}

// Kind of an initializer, consulting only bindings resolved so far.
// Used by the global pre-pass; the emitter re-checks during
// evaluation.
fn shallow_kind(e: &Expr, known: &HashMap<String, Kind>) -> Kind {
    match e {
        Expr::Str(_) => Kind::Str,
        Expr::List(_) => Kind::List,
        Expr::Slice(target, _, _) => shallow_kind(target, known),
        Expr::Call(name, _) => builtin_return_kind(name).unwrap_or(Kind::Num),
        Expr::Id(name) => known.get(name.as_str()).copied().unwrap_or(Kind::Num),
        _ => Kind::Num,
    }
}

// Walk statements, reporting every assigned name (including loop
// variables) outside nested function definitions.
fn collect_assigned<'a>(stmts: &'a [Stmt], visit: &mut impl FnMut(&'a str, Option<&'a Expr>)) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { name, value, .. } => visit(name, Some(value)),
            Stmt::If { then, otherwise, .. } => {
                collect_assigned(then, visit);
                collect_assigned(otherwise, visit);
            }
            Stmt::While { body, .. } => collect_assigned(body, visit),
            Stmt::ForIn { name, body, .. } => {
                visit(name, None);
                collect_assigned(body, visit);
            }
            _ => {}
        }
    }
}

fn expr_has_unscoped_predicate(e: &Expr) -> bool {
    match e {
        Expr::Predicate(_, target) => target.is_none(),
        Expr::Binary(_, l, r) => {
            expr_has_unscoped_predicate(l) || expr_has_unscoped_predicate(r)
        }
        Expr::Unary(_, x) => expr_has_unscoped_predicate(x),
        Expr::Call(_, args) | Expr::List(args) => args.iter().any(expr_has_unscoped_predicate),
        Expr::Index(t, i) => expr_has_unscoped_predicate(t) || expr_has_unscoped_predicate(i),
        Expr::Slice(t, s, e2) => {
            expr_has_unscoped_predicate(t)
                || expr_has_unscoped_predicate(s)
                || expr_has_unscoped_predicate(e2)
        }
        _ => false,
    }
}

fn stmt_has_unscoped_predicate(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Assign { value, .. } => expr_has_unscoped_predicate(value),
        Stmt::Expr { value, .. } => expr_has_unscoped_predicate(value),
        Stmt::Return { value, .. } => value
            .as_ref()
            .map(expr_has_unscoped_predicate)
            .unwrap_or(false),
        Stmt::If { cond, then, otherwise, .. } => {
            expr_has_unscoped_predicate(cond)
                || then.iter().any(stmt_has_unscoped_predicate)
                || otherwise.iter().any(stmt_has_unscoped_predicate)
        }
        Stmt::While { cond, body, .. } => {
            expr_has_unscoped_predicate(cond) || body.iter().any(stmt_has_unscoped_predicate)
        }
        Stmt::ForIn { iter, body, .. } => {
            expr_has_unscoped_predicate(iter) || body.iter().any(stmt_has_unscoped_predicate)
        }
        // Nested function bodies track on their own.
        _ => false,
    }
}

fn region_has_unscoped_predicate(stmts: &[Stmt]) -> bool {
    stmts.iter().any(stmt_has_unscoped_predicate)
}

fn region_has_unscoped_predicate_refs(stmts: &[&Stmt]) -> bool {
    stmts.iter().any(|s| stmt_has_unscoped_predicate(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{Expr, Node, PredicateKind, QuestionKind, Stmt};
    use crate::config::CodegenOptions;
    use lazy_static::lazy_static;
    use regex::Regex;

    fn emit(doc: &crate::ast::ModuleDoc) -> String {
        let mut opts = CodegenOptions::new(&doc.module);
        opts.observed_variables = doc.observed.clone();
        CodeGen::new(opts).emit_module(doc).unwrap()
    }

    fn while_loop(cond: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::While {
            cond,
            body,
            loc: Default::default(),
        }
    }

    fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Stmt {
        Stmt::If {
            cond,
            then,
            otherwise,
            loc: Default::default(),
        }
    }

    #[test]
    fn straight_line_print_program() {
        // x is 42 / print of x
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("x", num(42.0)),
                expr(call("print", vec![id("x")])),
            ],
        ));
        assert!(ir.contains("define i32 @main(i32 %argc, ptr %argv)"));
        assert!(ir.contains("call void @eigen_init_args(i32 %argc, ptr %argv)"));
        assert!(ir.contains(&format!(
            "store double {}, ptr @__eigs_global_x",
            crate::ir::double_constant(42.0)
        )));
        assert!(ir.contains("call void @eigen_print_val(double"));
        assert!(ir.contains("declare void @eigen_print_val(double)"));
    }

    #[test]
    fn fast_path_has_no_tracking_calls() {
        // A program that never observes x emits zero tracked-scalar
        // traffic for it.
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("x", num(1.0)),
                assign("y", bin(BinOp::Add, id("x"), num(2.0))),
                expr(call("print", vec![id("y")])),
            ],
        ));
        lazy_static! {
            static ref TRACKED_CALL: Regex = Regex::new(r"@eigen_tracked_\w+").unwrap();
        }
        assert!(!TRACKED_CALL.is_match(&ir), "unexpected tracking: {}", ir);
        assert!(!ir.contains("@eigen_track_value"));
        assert!(ir.contains("fadd double"));
    }

    #[test]
    fn observed_global_goes_geometric() {
        let ir = emit(&doc(
            "main",
            &["x"],
            vec![
                assign("x", num(1.0)),
                assign("x", num(2.0)),
                expr(Expr::Question(QuestionKind::Why, String::from("x"))),
            ],
        ));
        assert!(ir.contains("@__eigs_global_x = global ptr null"));
        assert!(ir.contains("call ptr @eigen_tracked_create(double"));
        assert!(ir.contains("call void @eigen_tracked_update(ptr"));
        assert!(ir.contains("call double @eigen_tracked_gradient(ptr"));
    }

    #[test]
    fn observed_local_lives_in_an_entry_alloca() {
        let ir = emit(&doc(
            "main",
            &["acc"],
            vec![Stmt::FunctionDef {
                name: String::from("step"),
                params: vec![],
                body: vec![
                    assign("acc", bin(BinOp::Mul, id("n"), num(2.0))),
                    assign("acc", bin(BinOp::Add, id("acc"), num(1.0))),
                    ret(Expr::Question(QuestionKind::How, String::from("acc"))),
                ],
                loc: Default::default(),
            }],
        ));
        assert!(ir.contains("%acc.t = alloca %eigen.tracked"));
        assert!(ir.contains("call void @eigen_tracked_init(ptr %acc.t"));
        assert!(ir.contains("call void @eigen_tracked_update(ptr %acc.t"));
        assert!(ir.contains("call double @eigen_tracked_stability(ptr %acc.t"));
        // Init must be aggressively inlinable.
        lazy_static! {
            static ref INIT_DECL: Regex =
                Regex::new(r"declare void @eigen_tracked_init\(ptr, double\) #(\d+)").unwrap();
        }
        let group = &INIT_DECL.captures(&ir).unwrap()[1];
        assert!(ir.contains(&format!("attributes #{} = {{ alwaysinline nounwind }}", group)));
    }

    #[test]
    fn functions_mangle_and_default_to_parameter_n() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                Stmt::FunctionDef {
                    name: String::from("double_it"),
                    params: vec![],
                    body: vec![ret(bin(BinOp::Mul, id("n"), num(2.0)))],
                    loc: Default::default(),
                },
                expr(call("print", vec![call("double_it", vec![num(21.0)])])),
            ],
        ));
        assert!(ir.contains("define double @main_double_it(double %n)"));
        assert!(ir.contains("call double @main_double_it(double"));
    }

    #[test]
    fn factorial_shape_compiles() {
        // define factorial as: if n < 2 return 1 else n * factorial(n-1)
        let body = vec![if_else(
            bin(BinOp::Lt, id("n"), num(2.0)),
            vec![ret(num(1.0))],
            vec![
                assign("prev", bin(BinOp::Sub, id("n"), num(1.0))),
                assign("sub", call("factorial", vec![id("prev")])),
                ret(bin(BinOp::Mul, id("n"), id("sub"))),
            ],
        )];
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                Stmt::FunctionDef {
                    name: String::from("factorial"),
                    params: vec![],
                    body,
                    loc: Default::default(),
                },
                expr(call("print", vec![call("factorial", vec![num(5.0)])])),
            ],
        ));
        assert!(ir.contains("define double @main_factorial(double %n)"));
        assert!(ir.contains("br i1"));
        assert!(ir.contains("ret double"));
        // Recursion is a direct call to the mangled symbol.
        assert!(ir.contains("call double @main_factorial(double"));
    }

    #[test]
    fn unscoped_predicate_inside_loop_feeds_the_tracker() {
        // loop while 1: guess is ...; if converged: break
        let program = vec![
            assign("guess", num(50.0)),
            while_loop(
                num(1.0),
                vec![
                    assign(
                        "guess",
                        bin(
                            BinOp::Div,
                            bin(
                                BinOp::Add,
                                id("guess"),
                                bin(BinOp::Div, num(100.0), id("guess")),
                            ),
                            num(2.0),
                        ),
                    ),
                    if_else(
                        Expr::Predicate(PredicateKind::Converged, None),
                        vec![Stmt::Break { loc: Default::default() }],
                        vec![],
                    ),
                ],
            ),
            expr(call("print", vec![id("guess")])),
        ];
        let ir = emit(&doc("main", &[], program));
        assert!(ir.contains("call void @eigen_track_value(double"));
        assert!(ir.contains("call double @eigen_is_converged()"));
        assert!(ir.contains("loop.head"));
        assert!(ir.contains("loop.end"));
    }

    #[test]
    fn scoped_predicate_reads_the_variables_own_history() {
        let ir = emit(&doc(
            "main",
            &["x"],
            vec![
                assign("x", num(1.0)),
                if_else(
                    Expr::Predicate(PredicateKind::Converged, Some(String::from("x"))),
                    vec![expr(call("print", vec![num(1.0)]))],
                    vec![],
                ),
            ],
        ));
        assert!(ir.contains("call double @eigen_check_converged(ptr"));
        assert!(!ir.contains("@eigen_is_converged"));
    }

    #[test]
    fn string_literals_dedup_and_escape() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                expr(call("print", vec![Expr::Str(String::from("line\none"))])),
                expr(call("print", vec![Expr::Str(String::from("line\none"))])),
            ],
        ));
        assert_eq!(ir.matches("@.str.0 = private unnamed_addr constant").count(), 1);
        assert!(ir.contains("c\"line\\0Aone\\00\""));
        assert!(!ir.contains("@.str.1 ="));
        assert!(ir.contains("@.str.0.boxed = internal global ptr null"));
        assert!(ir.contains("call ptr @eigen_string_from_cstr(ptr"));
    }

    #[test]
    fn list_literals_create_then_set() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("nums", Expr::List(vec![num(10.0), num(20.0), num(30.0)])),
                assign("a", index(id("nums"), num(0.0))),
                expr(call("print", vec![id("a")])),
            ],
        ));
        assert!(ir.contains("call ptr @eigen_list_create(i64 3)"));
        assert_eq!(ir.matches("call void @eigen_list_set(ptr").count(), 3);
        assert!(ir.contains("call double @eigen_list_get(ptr"));
        assert!(ir.contains("@__eigs_global_nums = global ptr null"));
    }

    #[test]
    fn for_in_iterates_with_latch() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("nums", Expr::List(vec![num(1.0), num(2.0)])),
                Stmt::ForIn {
                    name: String::from("x"),
                    iter: id("nums"),
                    body: vec![expr(call("print", vec![id("x")]))],
                    loc: Default::default(),
                },
            ],
        ));
        assert!(ir.contains("for.head"));
        assert!(ir.contains("for.latch"));
        assert!(ir.contains("call i64 @eigen_list_length(ptr"));
        assert!(ir.contains("icmp slt i64"));
    }

    #[test]
    fn library_mode_emits_init_instead_of_main() {
        let mut opts = CodegenOptions::new("physics");
        opts.library_mode = true;
        let ir = CodeGen::new(opts)
            .emit_module(&doc("physics", &[], vec![assign("g", num(9.8))]))
            .unwrap();
        assert!(ir.contains("define void @physics_init()"));
        assert!(!ir.contains("@main"));
        assert!(!ir.contains("eigen_init_args"));
    }

    #[test]
    fn unknown_names_become_external_globals() {
        let ir = emit(&doc(
            "consumer",
            &[],
            vec![assign("y", bin(BinOp::Add, id("shared"), num(1.0)))],
        ));
        assert!(ir.contains("@__eigs_global_shared = external global double"));
    }

    #[test]
    fn who_hashes_the_bit_pattern() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("x", num(3.0)),
                expr(call(
                    "print",
                    vec![Expr::Question(QuestionKind::Who, String::from("x"))],
                )),
            ],
        ));
        assert!(ir.contains("lshr i64"));
        assert!(ir.contains("xor i64"));
        assert!(ir.contains("and i64"));
        assert!(ir.contains("uitofp i64"));
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let mut opts = CodegenOptions::new("main");
        opts.observed_variables = Default::default();
        let err = CodeGen::new(opts)
            .emit_module(&doc("main", &[], vec![Stmt::Break { loc: Default::default() }]))
            .unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn comparisons_canonicalize_to_doubles() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![assign("flag", bin(BinOp::Lt, num(1.0), num(2.0)))],
        ));
        assert!(ir.contains("fcmp olt double"));
        assert!(ir.contains("uitofp i1"));
    }

    #[test]
    fn short_circuit_emits_blocks() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![assign(
                "ok",
                bin(BinOp::And, num(1.0), bin(BinOp::Gt, num(3.0), num(2.0))),
            )],
        ));
        assert!(ir.contains("logic.rhs"));
        assert!(ir.contains("logic.short"));
        assert!(ir.contains("logic.end"));
    }

    #[test]
    fn handles_cross_into_observed_slots_as_encoded_doubles() {
        let ir = emit(&doc(
            "main",
            &["x"],
            vec![
                assign("x", Expr::Str(String::from("tracked text"))),
                expr(Expr::Question(QuestionKind::What, String::from("x"))),
            ],
        ));
        assert!(ir.contains("ptrtoint ptr"));
        assert!(ir.contains("bitcast i64"));
        assert!(ir.contains("call ptr @eigen_tracked_create(double"));
    }

    #[test]
    fn import_declares_and_calls_the_init() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![Stmt::Import {
                module: String::from("physics"),
                loc: Default::default(),
            }],
        ));
        assert!(ir.contains("call void @physics_init()"));
        assert!(ir.contains("declare void @physics_init()"));
    }

    #[test]
    fn assignments_outside_tracking_regions_stay_silent() {
        // Oscillation program: top-level assignments plus an
        // unscoped predicate force per-assignment tracking.
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("x", num(1.0)),
                assign("x", num(0.0)),
                if_else(
                    Expr::Predicate(PredicateKind::Oscillating, None),
                    vec![expr(call("print", vec![num(1.0)]))],
                    vec![expr(call("print", vec![num(0.0)]))],
                ),
            ],
        ));
        assert_eq!(ir.matches("call void @eigen_track_value(double").count(), 2);
        assert!(ir.contains("call double @eigen_is_oscillating()"));
    }

    #[test]
    fn slices_pick_the_right_runtime_entry() {
        let ir = emit(&doc(
            "main",
            &[],
            vec![
                assign("l", Expr::List(vec![num(1.0), num(2.0), num(3.0)])),
                assign(
                    "mid",
                    Expr::Slice(
                        Node::new(id("l")),
                        Node::new(num(0.0)),
                        Node::new(num(2.0)),
                    ),
                ),
                assign("s", Expr::Str(String::from("substr"))),
                assign(
                    "part",
                    Expr::Slice(
                        Node::new(id("s")),
                        Node::new(num(1.0)),
                        Node::new(num(3.0)),
                    ),
                ),
            ],
        ));
        assert!(ir.contains("call ptr @eigen_list_slice(ptr"));
        assert!(ir.contains("call ptr @eigen_string_substring(ptr"));
    }
}
