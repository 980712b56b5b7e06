//! Built-in icalls: the console surface, primitive toString helpers and
//! the string/Error natives. Bound by name to native-declared methods
//! when the backend session opens.

use crate::domain::{current_domain, Domain};
use crate::gc::GcHooks;
use crate::strings;
use skizo_diagnostics::abort::{AbortCode, DomainAbort};
use std::ffi::c_void;

fn domain<'a>() -> &'a mut Domain {
    unsafe { current_domain() }.unwrap_or_else(|| {
        std::panic::panic_any(DomainAbort::with_message(
            "icall invoked without a bound domain",
        ))
    })
}

fn abort_code(code: AbortCode) -> ! {
    crate::domain::set_last_error(&code.to_string());
    std::panic::panic_any(DomainAbort::from_code(code))
}

fn make_string(text: &str) -> *mut c_void {
    match domain().create_string(text) {
        Ok(obj) => obj as *mut c_void,
        Err(_) => abort_code(AbortCode::OutOfMemory),
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _so_Console_printInt(value: i32) {
    println!("{}", value);
}

pub unsafe extern "C" fn _so_Console_printFloat(value: f32) {
    println!("{}", value);
}

pub unsafe extern "C" fn _so_Console_printBool(value: i32) {
    println!("{}", if value != 0 { "true" } else { "false" });
}

pub unsafe extern "C" fn _so_Console_printChar(value: u16) {
    match char::from_u32(value as u32) {
        Some(c) => println!("{}", c),
        None => println!("\u{fffd}"),
    }
}

pub unsafe extern "C" fn _so_Console_printString(value: *const u8) {
    if value.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    println!("{}", strings::read_string(value));
}

pub unsafe extern "C" fn _so_Console_readLine() -> *mut c_void {
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            make_string(&line)
        }
        Err(_) => make_string(""),
    }
}

// ---------------------------------------------------------------------------
// Primitive toString
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _so_int_toString(value: i32) -> *mut c_void {
    make_string(&value.to_string())
}

pub unsafe extern "C" fn _so_float_toString(value: f32) -> *mut c_void {
    make_string(&value.to_string())
}

pub unsafe extern "C" fn _so_bool_toString(value: i32) -> *mut c_void {
    make_string(if value != 0 { "true" } else { "false" })
}

pub unsafe extern "C" fn _so_char_toString(value: u16) -> *mut c_void {
    match char::from_u32(value as u32) {
        Some(c) => make_string(&c.to_string()),
        None => make_string("\u{fffd}"),
    }
}

// ---------------------------------------------------------------------------
// string
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _so_string_length(this: *const u8) -> i32 {
    if this.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    strings::string_length(this) as i32
}

pub unsafe extern "C" fn _so_string_op_add(a: *const u8, b: *const u8) -> *mut c_void {
    if a.is_null() || b.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    let mut text = strings::read_string(a);
    text.push_str(&strings::read_string(b));
    make_string(&text)
}

pub unsafe extern "C" fn _so_string_op_equals(a: *const u8, b: *const u8) -> i32 {
    if a.is_null() || b.is_null() {
        return (a == b) as i32;
    }
    (strings::read_string(a) == strings::read_string(b)) as i32
}

pub unsafe extern "C" fn _so_string_toString(this: *const u8) -> *const u8 {
    this
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _so_Error_create(message: *const u8) -> *mut c_void {
    let domain = domain();
    let Some(class_id) = domain.metadata().class_by_flat_name("Error") else {
        abort_code(AbortCode::MissingSymbol);
    };
    let Some(&vtable) = domain.vtables.get(&class_id) else {
        abort_code(AbortCode::MissingSymbol);
    };
    let size = domain.metadata().class(class_id).gc_info.content_size as usize;

    let dtors = std::mem::take(&mut domain.dtor_ptrs);
    let thunks: *mut crate::thunks::ThunkManager = &mut domain.thunks;
    let mut release = |obj: *mut u8| unsafe { (*thunks).release_closure(obj) };
    let mut hooks = GcHooks {
        dtors: &dtors,
        release_closure: &mut release,
    };
    let obj = domain
        .memory
        .allocate(&domain.metadata, size, vtable as *mut usize, &mut hooks);
    domain.dtor_ptrs = dtors;
    if obj.is_null() {
        abort_code(AbortCode::OutOfMemory);
    }
    *(obj.add(4) as *mut usize) = message as usize;
    obj as *mut c_void
}

pub unsafe extern "C" fn _so_Error_message(this: *const u8) -> *const u8 {
    if this.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    *(this.add(4) as *const *const u8)
}

/// The standard icall table registered for every domain.
pub fn default_icalls() -> Vec<(&'static str, *const c_void)> {
    vec![
        ("_so_Console_printInt", _so_Console_printInt as *const c_void),
        ("_so_Console_printFloat", _so_Console_printFloat as *const c_void),
        ("_so_Console_printBool", _so_Console_printBool as *const c_void),
        ("_so_Console_printChar", _so_Console_printChar as *const c_void),
        ("_so_Console_printString", _so_Console_printString as *const c_void),
        ("_so_Console_readLine", _so_Console_readLine as *const c_void),
        ("_so_int_toString", _so_int_toString as *const c_void),
        ("_so_float_toString", _so_float_toString as *const c_void),
        ("_so_bool_toString", _so_bool_toString as *const c_void),
        ("_so_char_toString", _so_char_toString as *const c_void),
        ("_so_string_length", _so_string_length as *const c_void),
        ("_so_string_op_add", _so_string_op_add as *const c_void),
        ("_so_string_op_equals", _so_string_op_equals as *const c_void),
        ("_so_string_toString", _so_string_toString as *const c_void),
        ("_so_Error_create", _so_Error_create as *const c_void),
        ("_so_Error_message", _so_Error_message as *const c_void),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_covers_builtin_natives() {
        let names: Vec<&str> = default_icalls().iter().map(|(n, _)| *n).collect();
        // Every Console print the transformer can lower to must be bound.
        for required in [
            "_so_Console_printInt",
            "_so_Console_printFloat",
            "_so_Console_printBool",
            "_so_Console_printChar",
            "_so_Console_printString",
            "_so_int_toString",
            "_so_string_op_add",
            "_so_Error_create",
        ] {
            assert!(names.contains(&required), "missing {}", required);
        }
    }
}
