use crate::bytecode::op::{Place, Var};
use crate::bytecode::{CodeObject, Op, ProgramBc};
use crate::lang::value::Value;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Names used to annotate operands. Missing names print as ids.
#[derive(Default)]
struct Names<'p> {
    functions: Vec<&'p str>,
    instance: &'p [String],
    global: &'p [String],
}

/// Render a whole program.
pub fn disassemble(program: &ProgramBc) -> String {
    let names = Names {
        functions: program.functions.iter().map(|f| f.name.as_str()).collect(),
        instance: &program.instance_names,
        global: &program.global_names,
    };

    let mut out = String::new();
    let _ = writeln!(out, "=== BYTECODE PROGRAM ===\n");
    for (index, code) in program.functions.iter().enumerate() {
        render_code(&mut out, index, code, &names);
    }
    out
}

/// Render one function without program-level names.
pub fn disassemble_code(code: &CodeObject) -> String {
    let mut out = String::new();
    render_code(&mut out, 0, code, &Names::default());
    out
}

fn render_code(out: &mut String, index: usize, code: &CodeObject, names: &Names) {
    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " [{}] {}", index, code.name);
    let _ = writeln!(
        out,
        " {} instructions, {} params{}, {} locals, {} statics",
        code.ops.len(),
        code.arity.params,
        if code.arity.variadic { " (variadic)" } else { "" },
        code.local_count,
        code.static_count
    );
    let _ = writeln!(out, "════════════════════════════════════════");

    let targets: BTreeSet<usize> = code.ops.iter().filter_map(|op| op.target().copied()).collect();
    let mut last_line = None;

    for (ip, op) in code.ops.iter().enumerate() {
        if targets.contains(&ip) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }

        let marker = if targets.contains(&ip) { "► " } else { "  " };
        let mut line = format!("{:04} {}{}", ip, marker, render_op(op, ip, names));

        if let Some(span) = code.span_at(ip) {
            if span.line != 0 && last_line != Some(span.line) {
                line = format!("{:<48} ; line {}", line, span.line);
                last_line = Some(span.line);
            }
        }
        let _ = writeln!(out, "{}", line);
    }
    let _ = writeln!(out);
}

fn format_value(v: &Value) -> String {
    match v {
        Value::String(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

fn lookup<'a>(table: &'a [String], id: u32) -> Option<&'a str> {
    table.get(id as usize).map(String::as_str)
}

fn var_name(var: &Var, names: &Names) -> String {
    let named = |prefix: &str, table: &[String], id: u32| match lookup(table, id) {
        Some(name) => format!("{} {}", prefix, name),
        None => format!("{} #{}", prefix, id),
    };
    match var {
        Var::Local(slot) => format!("local {}", slot),
        Var::Argument(i) => format!("arg {}", i),
        Var::Static(id) => format!("static {}", id),
        Var::Instance(id) => named("self", names.instance, *id),
        Var::Other(id) => named("other", names.instance, *id),
        Var::Global(id) => named("global", names.global, *id),
    }
}

fn place_name(place: &Place, names: &Names) -> String {
    let field = |id: u32| match lookup(names.instance, id) {
        Some(name) => format!(".{}", name),
        None => format!(".#{}", id),
    };
    match place {
        Place::Var(var) => var_name(var, names),
        Place::Indexed { var, dims } => format!("{}[{}]", var_name(var, names), dims),
        Place::Field(id) => field(*id),
        Place::FieldIndexed { field: id, dims } => format!("{}[{}]", field(*id), dims),
    }
}

fn jump(name: &str, ip: usize, target: usize) -> String {
    let direction = if target <= ip { "↑" } else { "↓" };
    format!("{:<12}{} (→ {:04})", name, direction, target)
}

fn render_op(op: &Op, ip: usize, names: &Names) -> String {
    let function = |index: u32| {
        names
            .functions
            .get(index as usize)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("#{}", index))
    };

    match op {
        Op::Push(v) => format!("PUSH        {}", format_value(v)),
        Op::Pop => "POP".to_string(),
        Op::Dup => "DUP".to_string(),
        Op::DupN(n) => format!("DUP_N       {}", n),
        Op::Tuck(n) => format!("TUCK        {}", n),
        Op::Swap => "SWAP".to_string(),

        Op::Add => "ADD".to_string(),
        Op::Sub => "SUB".to_string(),
        Op::Mul => "MUL".to_string(),
        Op::Div => "DIV".to_string(),
        Op::IntDiv => "INT_DIV".to_string(),
        Op::Mod => "MOD".to_string(),
        Op::BitAnd => "BIT_AND".to_string(),
        Op::BitOr => "BIT_OR".to_string(),
        Op::BitXor => "BIT_XOR".to_string(),
        Op::Shl => "SHL".to_string(),
        Op::Shr => "SHR".to_string(),
        Op::Xor => "XOR".to_string(),

        Op::Eq => "EQ".to_string(),
        Op::Ne => "NE".to_string(),
        Op::Lt => "LT".to_string(),
        Op::Gt => "GT".to_string(),
        Op::Le => "LE".to_string(),
        Op::Ge => "GE".to_string(),

        Op::Neg => "NEG".to_string(),
        Op::Not => "NOT".to_string(),
        Op::BitNot => "BIT_NOT".to_string(),
        Op::ToBool => "TO_BOOL".to_string(),

        Op::Load(place) => format!("LOAD        {}", place_name(place, names)),
        Op::Store(place) => format!("STORE       {}", place_name(place, names)),
        Op::LoadArgument => "LOAD_ARG    ; ( i -- argument[i] )".to_string(),
        Op::ArgumentCount => "ARG_COUNT".to_string(),
        Op::StaticInitialized(id) => format!("STATIC_INIT {}", id),

        Op::MakeArray(n) => format!("MAKE_ARRAY  {}", n),
        Op::Index => "INDEX       ; ( a i -- a[i] )".to_string(),

        Op::Jump(t) => jump("JUMP", ip, *t),
        Op::JumpIfFalse(t) => jump("JUMP_FALSE", ip, *t),
        Op::JumpIfTrue(t) => jump("JUMP_TRUE", ip, *t),

        Op::Call { function: index, argc } => format!("CALL        {} ({} args)", function(*index), argc),
        Op::CallBuiltin { id, argc } => format!("CALL_BI     #{} ({} args)", id, argc),
        Op::CallValue { argc } => format!("CALL_VALUE  ({} args)", argc),
        Op::PushFunction(index) => format!("PUSH_FN     {}", function(*index)),

        Op::WithEnter => "WITH_ENTER".to_string(),
        Op::WithNext(t) => jump("WITH_NEXT", ip, *t),
        Op::WithExit => "WITH_EXIT".to_string(),

        Op::SetReturn => "SET_RETURN".to_string(),
        Op::Ret => "RET".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ast::Span;

    fn program() -> ProgramBc {
        let mut main = CodeObject::empty("main");
        main.ops = vec![
            Op::Push(Value::string("hi")),
            Op::Store(Place::Var(Var::Global(0))),
            Op::Load(Place::Field(1)),
            Op::JumpIfFalse(5),
            Op::Call { function: 0, argc: 0 },
            Op::Jump(0),
        ];
        main.locations = vec![(0, Span::new(3, 1)), (2, Span::new(4, 1))];
        ProgramBc {
            functions: vec![main],
            instance_names: vec!["x".to_string(), "hp".to_string()],
            global_names: vec!["score".to_string()],
        }
    }

    #[test]
    fn test_names_and_markers() {
        let text = disassemble(&program());
        assert!(text.contains("[0] main"));
        assert!(text.contains("STORE       global score"));
        assert!(text.contains("LOAD        .hp"));
        assert!(text.contains("CALL        main (0 args)"));
        assert!(text.contains("0005 ► "));
        assert!(text.contains("0000 ► PUSH        \"hi\""));
    }

    #[test]
    fn test_jump_arrows() {
        let text = disassemble(&program());
        assert!(text.contains("JUMP_FALSE  ↓ (→ 0005)"));
        assert!(text.contains("JUMP        ↑ (→ 0000)"));
    }

    #[test]
    fn test_line_annotations() {
        let text = disassemble(&program());
        assert_eq!(text.matches("; line 3").count(), 1);
        assert_eq!(text.matches("; line 4").count(), 1);
    }

    #[test]
    fn test_code_without_names() {
        let text = disassemble_code(&program().functions[0]);
        assert!(text.contains("global #0"));
        assert!(text.contains("CALL        #0"));
    }
}
