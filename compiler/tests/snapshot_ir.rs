// Snapshot tests: lock the lowered IR text for small programs.
//
// Uses the library API (compile_source) with no implicit imports and
// snapshots `IrBuffer::render`. Snapshots are inline; run
// `cargo insta review` after intentional output changes.

use std::path::Path;

use wfc::config::Settings;

const PRELUDE: &str = r#"() trace (int i) "weft" "0.3" "trace";"#;

fn ir_snapshot(source: &str) -> String {
    let settings = Settings {
        implicit_imports: Vec::new(),
        ..Settings::default()
    };
    let src = format!("{}\n{}", PRELUDE, source);
    let out = wfc::pipeline::compile_source(Path::new("snap.weft"), &src, settings)
        .unwrap_or_else(|e| panic!("compile failed: {}", e));
    out.ir.render()
}

#[test]
fn snapshot_straight_line() {
    let ir = ir_snapshot("main { int x = 1; trace(x); }");
    insta::assert_snapshot!(ir, @r"
    require weft 0.3
    builtin trace = weft::trace 0.3
    function main () <- () CONTROL
      declare stack int x
      x := 1
      call trace () <- (x) CONTROL
    end function
    ");
}

#[test]
fn snapshot_if_else() {
    let ir = ir_snapshot("main { boolean c = true; if (c) { trace(1); } else { trace(2); } }");
    insta::assert_snapshot!(ir, @r"
    require weft 0.3
    builtin trace = weft::trace 0.3
    function main () <- () CONTROL
      declare stack boolean c
      c := true
      wait main-if0 (c) wait-only LOCAL_CONTROL
        declare local boolean __v0_c
        __v0_c <- c
        if __v0_c
          declare temp int __t1
          __t1 := 1
          call trace () <- (__t1) CONTROL
        else
          declare temp int __t2
          __t2 := 2
          call trace () <- (__t2) CONTROL
        end if
      end wait
    end function
    ");
}

#[test]
fn snapshot_app_function() {
    let ir = ir_snapshot(r#"app (file o) cp (file i) { "cp" @i @o; } main { }"#);
    insta::assert_snapshot!(ir, @r#"
    require weft 0.3
    builtin trace = weft::trace 0.3
    function cp (file o) <- (file i, int __location) SYNC
      declare alias string __alias0
      __alias0 := filename(i)
      declare alias string __alias1
      __alias1 := filename(o) init-unmapped
      wait cp-app-leaf0 (__alias0, i, __alias1) dispatch WORKER deep Location=__location
        declare local string __fname2_i
        __fname2_i <- __alias0
        declare local string __fname3_o
        __fname3_o <- __alias1
        declare local file __v4_i
        __v4_i <- i
        declare local file __v5_o
        init_local_out_file __v5_o __fname3_o for o
        run "cp" [__fname2_i, __fname3_o] in (__v4_i) out (__v5_o)
        o := __v5_o
        decr_local_file_ref __v5_o
      end wait
    end function
    function main () <- () CONTROL
    end function
    "#);
}
