//! A dynamically-typed register value, mirroring the source's `union Value
//! { intptr_t vi; float vf; }`: the interpreter always knows from the
//! producing `Op`'s `result_type` which arm is meaningful, so `Value` itself
//! stays a plain two-variant enum rather than re-deriving the type tag.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Covers both `i32` and `i64` (address) results; arithmetic opcodes
    /// decide the width from the producing op's `ValueType`.
    Int(i64),
    Float(f32),
}

impl Value {
    pub fn as_int(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Float(v) => v as i64,
        }
    }

    pub fn as_i32(self) -> i32 {
        self.as_int() as i32
    }

    pub fn as_float(self) -> f32 {
        match self {
            Value::Float(v) => v,
            Value::Int(v) => v as f32,
        }
    }

    pub fn truthy(self) -> bool {
        self.as_int() != 0
    }
}
