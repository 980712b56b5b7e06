// Domain lifecycle and remoting behaviour that crosses module boundaries.

use skizo_runtime::{
    create_remote_domain, Domain, DomainCreation, StubBackend, REMOTE_CALL_TIMEOUT,
};
use skizo_metadata::MethodId;
use std::time::Instant;

#[test]
fn test_create_compile_close_cycle() {
    let creation = DomainCreation::new(
        "class A { field x:int; method get:int { return x; } }
         class Program { static method main { a:=(A create); print (a get); } }",
    );
    let domain = Domain::create(creation, Box::new(StubBackend::new())).unwrap();

    let md = domain.metadata();
    let a = md.class(md.class_by_nice_name("A").unwrap());
    // Classes without static ctors are initialised during creation.
    assert!(a.is_initialized);
    domain.close();
}

#[test]
fn test_gc_roots_embedding_surface() {
    let creation = DomainCreation::new("class Program { static method main { } }");
    let mut domain = Domain::create(creation, Box::new(StubBackend::new())).unwrap();

    // Without a live heap object the root call must refuse politely.
    assert!(!domain.add_gc_root(std::ptr::null_mut()));
    assert!(!domain.remove_gc_root(std::ptr::null_mut()));
    domain.collect_garbage();
    assert_eq!(domain.object_count(), 0);
    domain.close();
}

#[test]
fn test_remote_domain_handle_and_late_call_timeout() {
    let creation = DomainCreation::new("class Program { static method main { } }");
    let handle = create_remote_domain(creation, || Box::new(StubBackend::new())).unwrap();

    // The remote domain ran its (symbol-less) entry point and exited;
    // calls after exit abort the sender quickly.
    let started = Instant::now();
    let result = handle.send_sync("obj", MethodId(0), vec![]);
    assert!(result.is_err());
    assert!(started.elapsed() < REMOTE_CALL_TIMEOUT);
    handle.join();
}

#[test]
fn test_untrusted_domain_rejects_ecalls() {
    let mut creation = DomainCreation::new(
        "class Native { [module=m] native method cosf(x:float):float; }
         class Program { static method main { } }",
    );
    creation.is_untrusted = true;
    // In untrusted domains the ecall compiles to a disallowed-call stub,
    // so creation succeeds without resolving the module.
    let domain = Domain::create(creation, Box::new(StubBackend::new())).unwrap();
    let md = domain.metadata();
    let native = md.class(md.class_by_nice_name("Native").unwrap());
    let m = match native.member("cosf") {
        Some(skizo_metadata::MemberRef::Method(m)) => m,
        other => panic!("unexpected member {:?}", other),
    };
    assert_eq!(
        md.method(m).special,
        skizo_metadata::SpecialMethod::DisallowedECall
    );
    domain.close();
}
