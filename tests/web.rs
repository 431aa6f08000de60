// Browser tests for the wasm facade: the paths that need a JS runtime (JsValue trees,
// Date-stamped condition ids, error surfacing). Run with `wasm-pack test --headless --chrome`.
#![cfg(target_arch = "wasm32")]

use timeline_core::{TimelineCompiler, WasmConditionEditor};
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

#[wasm_bindgen_test]
fn compile_object_accepts_js_tree() {
    let tree = js_sys::JSON::parse(r#"[{"trialId": "a", "trialName": "A"}]"#).unwrap();
    let compiler = TimelineCompiler::new("").unwrap();
    let script = compiler.compile_object(tree).unwrap();
    assert!(script.contains("timeline.push(node_a);"));
}

#[wasm_bindgen_test]
fn invalid_tree_surfaces_message() {
    let compiler = TimelineCompiler::new("").unwrap();
    let err = compiler.compile("not json").unwrap_err();
    assert!(err.as_string().unwrap().contains("Serialization error"));
}

#[wasm_bindgen_test]
fn new_conditions_get_timestamp_ids() {
    let mut editor = WasmConditionEditor::new("branch", "").unwrap();
    let id = editor.add_condition();
    assert!(id > 0.0);
    editor.set_target(id, Some("b".to_string())).unwrap();
    assert!(editor.to_json().unwrap().contains("\"nextTrialId\":\"b\""));
}
