//! Postfix stack-machine interface
//!
//! The writer drives an `Emitter`; how instructions become assembly is the
//! emitter's business. `PostfixBuffer` keeps them in memory and renders a
//! textual listing, one instruction per line.

use std::fmt;

/// Kind of a public symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Func,
    Obj,
}

/// One postfix instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // ==================== Segments and symbols ====================
    Text,
    Data,
    Rodata,
    Bss,
    Align,
    Label(String),
    Global(String, SymbolKind),
    Extern(String),

    // ==================== Static data ====================
    SInt(i32),
    SDouble(f64),
    SString(String),
    SAddr(String),
    SAlloc(u32),

    // ==================== Stack ====================
    Int(i32),
    Double(f64),
    /// address of a label
    Addr(String),
    /// frame pointer + offset
    Local(i32),
    /// current stack pointer
    Sp,
    LdInt,
    LdDouble,
    StInt,
    StDouble,
    /// reserve bytes on the stack
    Alloc,
    Dup32,
    Dup64,
    /// discard bytes from the top of the stack
    Trash(u32),

    // ==================== Arithmetic ====================
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    DAdd,
    DSub,
    DMul,
    DDiv,
    DNeg,
    I2D,

    // ==================== Comparison and logic ====================
    Lt,
    Le,
    Ge,
    Gt,
    Eq,
    Ne,
    /// compare two doubles, leaving an int
    DCmp,
    And,
    Or,

    // ==================== Control ====================
    Jmp(String),
    Jz(String),
    Jnz(String),
    Call(String),
    Ret,
    Enter(u32),
    Leave,
    LdFval32,
    LdFval64,
    StFval32,
    StFval64,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "TEXT"),
            Self::Data => write!(f, "DATA"),
            Self::Rodata => write!(f, "RODATA"),
            Self::Bss => write!(f, "BSS"),
            Self::Align => write!(f, "ALIGN"),
            Self::Label(l) => write!(f, "LABEL {}", l),
            Self::Global(name, SymbolKind::Func) => write!(f, "GLOBAL {}, FUNC", name),
            Self::Global(name, SymbolKind::Obj) => write!(f, "GLOBAL {}, OBJ", name),
            Self::Extern(name) => write!(f, "EXTERN {}", name),
            Self::SInt(v) => write!(f, "SINT {}", v),
            Self::SDouble(v) => write!(f, "SDOUBLE {:?}", v),
            Self::SString(s) => write!(f, "SSTRING {:?}", s),
            Self::SAddr(l) => write!(f, "SADDR {}", l),
            Self::SAlloc(n) => write!(f, "SALLOC {}", n),
            Self::Int(v) => write!(f, "INT {}", v),
            Self::Double(v) => write!(f, "DOUBLE {:?}", v),
            Self::Addr(l) => write!(f, "ADDR {}", l),
            Self::Local(o) => write!(f, "LOCAL {}", o),
            Self::Sp => write!(f, "SP"),
            Self::LdInt => write!(f, "LDINT"),
            Self::LdDouble => write!(f, "LDDOUBLE"),
            Self::StInt => write!(f, "STINT"),
            Self::StDouble => write!(f, "STDOUBLE"),
            Self::Alloc => write!(f, "ALLOC"),
            Self::Dup32 => write!(f, "DUP32"),
            Self::Dup64 => write!(f, "DUP64"),
            Self::Trash(n) => write!(f, "TRASH {}", n),
            Self::Add => write!(f, "ADD"),
            Self::Sub => write!(f, "SUB"),
            Self::Mul => write!(f, "MUL"),
            Self::Div => write!(f, "DIV"),
            Self::Mod => write!(f, "MOD"),
            Self::Neg => write!(f, "NEG"),
            Self::DAdd => write!(f, "DADD"),
            Self::DSub => write!(f, "DSUB"),
            Self::DMul => write!(f, "DMUL"),
            Self::DDiv => write!(f, "DDIV"),
            Self::DNeg => write!(f, "DNEG"),
            Self::I2D => write!(f, "I2D"),
            Self::Lt => write!(f, "LT"),
            Self::Le => write!(f, "LE"),
            Self::Ge => write!(f, "GE"),
            Self::Gt => write!(f, "GT"),
            Self::Eq => write!(f, "EQ"),
            Self::Ne => write!(f, "NE"),
            Self::DCmp => write!(f, "DCMP"),
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Jmp(l) => write!(f, "JMP {}", l),
            Self::Jz(l) => write!(f, "JZ {}", l),
            Self::Jnz(l) => write!(f, "JNZ {}", l),
            Self::Call(l) => write!(f, "CALL {}", l),
            Self::Ret => write!(f, "RET"),
            Self::Enter(n) => write!(f, "ENTER {}", n),
            Self::Leave => write!(f, "LEAVE"),
            Self::LdFval32 => write!(f, "LDFVAL32"),
            Self::LdFval64 => write!(f, "LDFVAL64"),
            Self::StFval32 => write!(f, "STFVAL32"),
            Self::StFval64 => write!(f, "STFVAL64"),
        }
    }
}

/// Postfix code sink (backend abstraction)
pub trait Emitter {
    fn emit(&mut self, instr: Instr);
}

/// In-memory emitter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostfixBuffer {
    instructions: Vec<Instr>,
}

impl PostfixBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instructions
    }

    /// Textual listing; labels and segment switches are not indented
    pub fn render(&self) -> String {
        let mut out = String::new();
        for instr in &self.instructions {
            let flush = matches!(
                instr,
                Instr::Label(_) | Instr::Text | Instr::Data | Instr::Rodata | Instr::Bss
            );
            if !flush {
                out.push('\t');
            }
            out.push_str(&instr.to_string());
            out.push('\n');
        }
        out
    }
}

impl Emitter for PostfixBuffer {
    fn emit(&mut self, instr: Instr) {
        self.instructions.push(instr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_listing() {
        let mut buffer = PostfixBuffer::new();
        buffer.emit(Instr::Text);
        buffer.emit(Instr::Label("_main".into()));
        buffer.emit(Instr::Enter(8));
        buffer.emit(Instr::Double(2.0));
        buffer.emit(Instr::Global("_main".into(), SymbolKind::Func));
        assert_eq!(buffer.render(), "TEXT\nLABEL _main\n\tENTER 8\n\tDOUBLE 2.0\n\tGLOBAL _main, FUNC\n");
        assert_eq!(buffer.instructions().len(), 5);
    }
}
