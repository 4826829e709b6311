//! Printer/parser round trips: parsing well-formed IR text and printing it
//! again reproduces the input byte for byte.

fn roundtrip(src: &str) {
    let ctx = gantry_reader::parse_unit(src).expect("parse failed");
    let printed = ctx.write_ir();
    assert_eq!(printed, src, "print of parse differs from input");

    // And the fixpoint holds.
    let again = gantry_reader::parse_unit(&printed).expect("reparse failed");
    assert_eq!(again.write_ir(), printed);
}

#[test]
fn constant_return() {
    roundtrip("defun main {\nbb0:\n    %0 = imm 42\n    ret %0\n}\n");
}

#[test]
fn negative_and_boundary_immediates() {
    roundtrip(
        "defun main {\nbb0:\n    %0 = imm -1\n    %1 = imm 9223372036854775807\n    %2 = imm -9223372036854775808\n    %3 = add %1, %2\n    ret %3\n}\n",
    );
}

#[test]
fn statics_and_calls() {
    roundtrip(
        "static msg = \"Hello, world!\\n\"\nstatic counter = 0\nstatic buffer 16\n\ndeclare puts\n\ndefun main {\nbb0:\n    %0 = static.ref msg\n    %1 = call puts(%0)\n    ret %1\n}\n",
    );
}

#[test]
fn control_flow_and_phis() {
    roundtrip(
        "defun pick {\nbb0:\n    %0 = imm 1\n    br.cond %0, bb1, bb2\nbb1:\n    %1 = imm 2\n    %2 = copy %1\n    br bb3\nbb2:\n    %3 = imm 3\n    %4 = copy %3\n    br bb3\nbb3:\n    %5 = phi [bb1, %2], [bb2, %4]\n    ret %5\n}\n",
    );
}

#[test]
fn loads_stores_and_allocas() {
    roundtrip(
        "defun main {\nbb0:\n    %0 = alloca 8\n    %1 = imm 7\n    store %1, %0\n    %2 = load %0\n    ret %2\n}\n",
    );
}

#[test]
fn every_binary_operator() {
    roundtrip(
        "defun ops {\nbb0:\n    %0 = imm 6\n    %1 = imm 3\n    %2 = add %0, %1\n    %3 = sub %2, %1\n    %4 = mul %3, %1\n    %5 = div %4, %1\n    %6 = mod %5, %1\n    %7 = shl %6, %1\n    %8 = sar %7, %1\n    %9 = shr %8, %1\n    %10 = and %9, %1\n    %11 = or %10, %1\n    %12 = lt %11, %1\n    %13 = le %12, %1\n    %14 = gt %13, %1\n    %15 = ge %14, %1\n    %16 = eq %15, %1\n    %17 = ne %16, %1\n    %18 = not %17\n    ret %18\n}\n",
    );
}

#[test]
fn indirect_and_tail_calls() {
    roundtrip(
        "defun target {\nbb0:\n    %0 = imm 0\n    ret %0\n}\n\ndefun main {\nbb0:\n    %0 = func.ref target\n    %1 = call %0()\n    %2 = call.tail target(%1)\n    ret %2\n}\n",
    );
}

#[test]
fn void_calls_stay_void() {
    roundtrip(
        "declare exit\n\ndefun main {\nbb0:\n    %0 = imm 0\n    call exit(%0)\n    unreachable\n}\n",
    );
}
