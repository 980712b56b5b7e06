// End-to-end pipeline tests: source text in, emitted C and final metadata
// out. These pin the observable shapes of the translation unit.

use skizo_compiler::{compile_units, CompileOptions, Compilation};
use skizo_metadata::{MemberRef, SpecialClass, SpecialMethod};
use skizo_parser::Parser;

fn compile(source: &str) -> Compilation {
    compile_with(source, &CompileOptions::default())
}

fn compile_with(source: &str, options: &CompileOptions) -> Compilation {
    let unit = Parser::new("test", source).unwrap().parse_unit().unwrap();
    compile_units(&[unit], options).unwrap()
}

#[test]
fn test_print_arithmetic() {
    let c = compile("class Program { static method main { print 1+2; } }");
    assert!(c.c_source.contains("void _so_Program_main(void)"));
    assert!(c.c_source.contains("_so_Console_printInt(((1) + (2)));"));
    // The icall itself is an extern, not a body.
    assert!(c.c_source.contains("extern void _so_Console_printInt(int p_value);"));
}

#[test]
fn test_default_ctor_and_getter() {
    let c = compile(
        "class A { field x:int; method get:int { return x; } }
         class Program { static method main { a:=(A create); print (a get); } }",
    );
    // The generated default ctor allocates through the GC.
    assert!(c.c_source.contains("_so_A* _so_A_create(void)"));
    assert!(c.c_source.contains("_soX_gc_alloc(_soX_domain"));
    // `get` is never overridden, so the call bypasses the vtable.
    assert!(c.c_source.contains("_so_A_get("));
    assert!(!c.c_source.contains("_soX_vch_A_get(((_so_A*)"));
}

#[test]
fn test_virtual_dispatch_goes_through_vch() {
    let c = compile(
        "class A { method run:int { return 1; } }
         class B: A { method run:int { return 2; } }
         class Program { static method main { a: A = (B create); print (a run); } }",
    );
    assert!(c.c_source.contains("static int _soX_vch_A_run(_so_A* self)"));
    assert!(c.c_source.contains("_soX_vch_A_run("));
    // Vtable slot 0 stays open for the class word; slot 1 holds run.
    assert!(c.c_source.contains("void* _so_vtbl_A[2]"));
}

#[test]
fn test_upcast_inserted_for_assignment() {
    let c = compile(
        "class A { } class B: A { }
         class Program { static method main { a: A = (B create); } }",
    );
    assert!(c.c_source.contains("l_a = ((_so_A*)(_so_B_create()));"));
}

#[test]
fn test_enum_lowering_and_rangecheck() {
    let c = compile(
        "enum Color { Red; Green; Blue }
         class Program { static method main { print ((Color Red) toString); } }",
    );
    // fromInt range-checks with the RANGECHECK abort code.
    assert!(c
        .c_source
        .contains("if(p_value < 0 || p_value >= 3) _soX_abort0(0);"));
    // toString switches over the value slot.
    assert!(c.c_source.contains("switch(self->m_value)"));
    // Items are built by the trapped static ctor.
    assert!(c.c_source.contains("_so_Color_s_Red = _so_Color_createItem(0);"));
    assert!(c.c_source.contains("_soX_cctor(domain"));

    let color = c.metadata.class(c.metadata.class_by_flat_name("Color").unwrap());
    let from_int = match color.member("fromInt") {
        Some(MemberRef::Method(m)) => m,
        other => panic!("unexpected fromInt member: {:?}", other),
    };
    assert_eq!(
        c.metadata.method(from_int).special,
        SpecialMethod::EnumFromInt
    );
}

#[test]
fn test_failable_conversion() {
    let c = compile(
        "class Program { static method parse:int? { return 42; } static method main { } }",
    );
    assert!(c.c_source.contains("_so_0Failable_int_fromValue(42)"));
    // The accessor aborts with the contained error.
    assert!(c
        .c_source
        .contains("if(self.m_hasError) _soX_abort_e((void*)self.m_error);"));
}

#[test]
fn test_array_init_and_access() {
    let c = compile(
        "class Program { static method main { xs: [int] = [1 2 3]; print (xs get 0); } }",
    );
    assert!(c.c_source.contains("_soX_arrinit_0(1, 2, 3)"));
    assert!(c.c_source.contains("_soX_arrget_0Array_int("));
    // Range check aborts with code 0, null dereference with 2.
    assert!(c.c_source.contains("_soX_abort0(0)"));
    assert!(c.c_source.contains("_soX_abort0(2)"));
}

#[test]
fn test_closure_env_generated_for_captures() {
    let c = compile(
        "class Program { static method main {
            x := 1;
            f := (method:int { return x; });
         } }",
    );
    // The capturing method allocates an env and stores the local there.
    assert!(c.c_source.contains("_soX_gc_alloc_env(_soX_domain"));
    assert!(c.c_source.contains("l_env->x"));
    // The closure literal compiles to the thunk-generated ctor.
    assert!(c.c_source.contains("_so_0Closure_0_ctor((void*)l_env)"));

    let env = c.metadata.class_by_flat_name("0ClosureEnv_0").unwrap();
    assert_eq!(c.metadata.class(env).special, SpecialClass::ClosureEnv);
}

#[test]
fn test_inlined_branching() {
    let c = compile(
        "class Program { static method main {
            x := 0;
            (x < 10) then { x = (x + 1); };
         } }",
    );
    // No closure class was generated; the branch is inline C.
    assert!(c.metadata.class_by_flat_name("0Closure_0").is_none());
    assert!(c.c_source.contains("if("));
}

#[test]
fn test_inlined_while_loop() {
    let c = compile(
        "class Program { static method main {
            x := 0;
            (method:bool { return (x < 10); }) while { x = (x + 1); };
         } }",
    );
    assert!(c.c_source.contains("for(;;) {"));
    assert!(c.c_source.contains("break;"));
}

#[test]
fn test_interface_dispatch_uses_findmethod() {
    let c = compile(
        "interface Greeter { method greet:int; }
         class A: Greeter { method greet:int { return 7; } }
         class Program { static method main { g: Greeter = (A create); print (g greet); } }",
    );
    assert!(c.c_source.contains("_soX_findmethod((void*)self"));
    assert!(c.c_source.contains("_soX_icall_Greeter_greet("));
}

#[test]
fn test_foreign_proxy_stubs() {
    let c = compile(
        "class Counter { method inc(x:int):int { return (x + 1); } }
         force Counter*;
         class Program { static method main { } }",
    );
    // Client stub blocks on the synchronous send.
    assert!(c.c_source.contains("_soX_msgsnd_sync(self->m_hDomain"));
    // Server stub unpacks and dispatches by name.
    assert!(c.c_source.contains("void _soX_srvstub_Counter_inc("));
    assert!(c.c_source.contains("_soX_findmethod2(self, \"inc\")"));
}

#[test]
fn test_event_fire_iterates_snapshot() {
    let c = compile(
        "class A { event changed: Action; }
         class Program { static method main { } }",
    );
    assert!(c.c_source.contains("l_snapshot = (_soX_ArrayHeader*)self->m_handlers;"));
    assert!(c.c_source.contains("_soX_addhandler((void*)self"));
}

#[test]
fn test_stack_trace_frames() {
    let options = CompileOptions {
        stack_trace_enabled: true,
        ..CompileOptions::default()
    };
    let c = compile_with(
        "class Program { static method main { print 1; } }",
        &options,
    );
    assert!(c.c_source.contains("_soX_pushframe(_soX_domain"));
    assert!(c.c_source.contains("_soX_popframe(_soX_domain);"));
}

#[test]
fn test_static_fields_and_prolog_roots() {
    let c = compile(
        "class Registry { static field last: Registry; }
         class Program { static method main { } }",
    );
    assert!(c.c_source.contains("_so_Registry* _so_Registry_last = 0;"));
    assert!(c.c_source.contains("_soX_gc_roots(domain"));
}

#[test]
fn test_binary_blob_layout() {
    let c = compile(
        "[nativeSize=8] struct Pair { }
         class Program { static method main { print (sizeof Pair); } }",
    );
    assert!(c.c_source.contains("struct _so_Pair { char _soX_data[8]; };"));
    // sizeof lowers to the metadata constant.
    assert!(c.c_source.contains("_so_Console_printInt(8);"));
}

#[test]
fn test_division_uses_guarded_helper() {
    let c = compile("class Program { static method main { print (4 / 2); } }");
    assert!(c.c_source.contains("_so_int_op_divide(4, 2)"));
}

#[test]
fn test_string_literals_are_table_slots() {
    let c = compile("class Program { static method main { print \"hi\"; } }");
    assert!(c.c_source.contains("_soX_strlits["));
    assert_eq!(c.string_literals, vec!["hi".to_string()]);
}

#[test]
fn test_abort_statement() {
    let c = compile("class Program { static method main { abort \"bad state\"; } }");
    assert!(c.c_source.contains("_soX_abort_e((void*)"));
    assert!(c.string_literals.contains(&"bad state".to_string()));
}

#[test]
fn test_unresolved_class_reports_suggestion() {
    let unit = Parser::new(
        "test",
        "class Program { static method main { a:=(Progam create); } }",
    )
    .unwrap()
    .parse_unit()
    .unwrap();
    let err = compile_units(&[unit], &CompileOptions::default()).unwrap_err();
    assert!(err.to_string().contains("Program"), "{}", err);
}

#[test]
fn test_vtable_index_stability() {
    let c = compile(
        "class A { method one { } method two { } }
         class B: A { method two { } method three { } }
         class Program { static method main { } }",
    );
    let md = &c.metadata;
    let a = md.class(md.class_by_flat_name("A").unwrap());
    let b = md.class(md.class_by_flat_name("B").unwrap());
    // B's list is A's list with `two` replaced in place and `three` appended.
    assert_eq!(b.instance_methods.len(), a.instance_methods.len() + 1);
    for (i, &mid) in b.instance_methods.iter().enumerate() {
        assert_eq!(md.method(mid).vtable_index, i as i32);
    }
    let b_two = match b.member("two") {
        Some(MemberRef::Method(m)) => m,
        other => panic!("unexpected member: {:?}", other),
    };
    let a_two = match a.member("two") {
        Some(MemberRef::Method(m)) => m,
        other => panic!("unexpected member: {:?}", other),
    };
    assert_eq!(md.method(b_two).vtable_index, md.method(a_two).vtable_index);
    assert_eq!(md.method(b_two).base_method, Some(a_two));
}
