use rhai::Dynamic;
use scriptwarden::libraries::{PrintLibrary, PrintStats};
use scriptwarden::registry::{current_instance, is_active};
use scriptwarden::{Instance, RuntimeConfig, ScriptLoader};

fn initialized(main: &str) -> Instance {
    initialized_with(&[("main", main)])
}

fn initialized_with(sources: &[(&str, &str)]) -> Instance {
    let mut loader = ScriptLoader::new(&RuntimeConfig::default());
    for (name, source) in sources {
        loader.add_source(*name, *source);
    }
    loader.set_mainfile("main");
    let mut instance = Instance::new(loader.compile().expect("scripts compile"), &RuntimeConfig::default());
    instance.initialize().expect("initialize");
    instance
}

fn printed(instance: &Instance) -> Vec<String> {
    instance.library::<PrintLibrary>().expect("print library installed").output()
}

const THREE_HANDLERS: &str = r#"
hook_add("think", "a", || { print("a"); });
hook_add("think", "b", || { throw "boom"; });
hook_add("think", "c", || { print("c"); });
"#;

#[test]
fn handlers_run_in_registration_order() {
    let mut instance = initialized(
        r#"
        hook_add("tick", "first", |n| { print("first " + n); });
        hook_add("tick", "second", |n| { print("second " + n); });
        "#,
    );
    instance.run_script_hook("tick", &[Dynamic::from(3 as rhai::INT)]).expect("tick");
    assert_eq!(printed(&instance), vec!["first 3", "second 3"]);
}

#[test]
fn hook_names_are_case_insensitive() {
    let mut instance = initialized(r#"hook_add("Think", "a", || { print("a"); });"#);
    instance.run_script_hook("THINK", &[]).expect("think");
    assert_eq!(printed(&instance), vec!["a"]);
}

#[test]
fn first_failure_stops_dispatch_and_poisons_the_instance() {
    let mut instance = initialized(THREE_HANDLERS);
    let failure = instance.run_script_hook("think", &[]).unwrap_err();
    assert_eq!(failure.message(), "boom");
    assert_eq!(printed(&instance), vec!["a"]);
    assert!(instance.is_errored());
    assert!(!is_active(instance.id()));
    assert_eq!(current_instance(), None);

    instance.run_script_hook("think", &[]).expect("errored dispatch is empty");
    assert_eq!(printed(&instance), vec!["a"]);
}

#[test]
fn iteration_yields_one_outcome_per_step_and_ends_after_a_failure() {
    let mut instance = initialized(THREE_HANDLERS);
    let outcomes: Vec<_> = instance.iterate("think", &[]).collect();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].as_ref().is_ok_and(|values| values.is_empty()));
    assert_eq!(outcomes[1].as_ref().unwrap_err().message(), "boom");
}

#[test]
fn iteration_is_lazy() {
    let mut instance = initialized(THREE_HANDLERS);
    let mut iter = instance.iterate("think", &[]);
    assert!(iter.next().expect("first step").is_ok());
    drop(iter);
    assert_eq!(printed(&instance), vec!["a"]);
    assert!(!instance.is_errored());
}

#[test]
fn hook_without_handlers_is_an_empty_success() {
    let mut instance = initialized("let a = 1;");
    instance.run_script_hook("nothing", &[]).expect("empty hook");
    assert_eq!(instance.run_script_hook_for_result("nothing", &[]).expect("empty hook"), None);
    assert_eq!(instance.iterate("nothing", &[]).count(), 0);
}

#[test]
fn for_result_stops_at_the_first_truthy_result() {
    let mut instance = initialized(
        r#"
        hook_add("query", "h1", || ());
        hook_add("query", "h2", || [true, "x"]);
        hook_add("query", "h3", || { print("h3"); [true, "y"] });
        "#,
    );
    let values = instance.run_script_hook_for_result("query", &[]).expect("query").expect("a result");
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].as_bool(), Ok(true));
    assert_eq!(values[1].clone().into_string().as_deref(), Ok("x"));
    assert!(printed(&instance).is_empty());
}

#[test]
fn for_result_skips_falsy_first_values() {
    let mut instance = initialized(
        r#"
        hook_add("query", "no", || [false, "ignored"]);
        hook_add("query", "scalar", || 0);
        "#,
    );
    let values = instance.run_script_hook_for_result("query", &[]).expect("query").expect("a result");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_int(), Ok(0));
}

#[test]
fn for_result_propagates_failures() {
    let mut instance = initialized(
        r#"
        hook_add("query", "bad", || { throw "no answer"; });
        hook_add("query", "good", || true);
        "#,
    );
    let failure = instance.run_script_hook_for_result("query", &[]).unwrap_err();
    assert_eq!(failure.message(), "no answer");
    assert!(instance.is_errored());
}

#[test]
fn registrations_during_dispatch_apply_to_the_next_dispatch() {
    let mut instance = initialized(
        r#"
        hook_add("tick", "spawner", || {
            print("spawner");
            hook_add("tick", "late", || { print("late"); });
        });
        "#,
    );
    instance.run_script_hook("tick", &[]).expect("first tick");
    assert_eq!(printed(&instance), vec!["spawner"]);
    instance.run_script_hook("tick", &[]).expect("second tick");
    assert_eq!(printed(&instance), vec!["spawner", "spawner", "late"]);
    assert_eq!(instance.hooks().borrow().handler_names("tick"), vec!["spawner", "late"]);
}

#[test]
fn handlers_can_be_removed_by_name() {
    let mut instance = initialized(
        r#"
        hook_add("tick", "a", || { print("a"); });
        hook_add("tick", "b", || { print("b"); });
        hook_add("cleanup", "drop_a", || hook_remove("tick", "a"));
        "#,
    );
    let removed = instance.run_script_hook_for_result("cleanup", &[]).expect("cleanup");
    assert!(removed.is_some());
    instance.run_script_hook("tick", &[]).expect("tick");
    assert_eq!(printed(&instance), vec!["b"]);
}

#[test]
fn closures_keep_script_state_between_dispatches() {
    let mut instance = initialized(
        r#"
        let total = 0;
        hook_add("add", "sum", |n| { total += n; total });
        "#,
    );
    instance.run_script_hook("add", &[Dynamic::from(2 as rhai::INT)]).expect("add");
    let values = instance
        .run_script_hook_for_result("add", &[Dynamic::from(3 as rhai::INT)])
        .expect("add")
        .expect("a result");
    assert_eq!(values[0].as_int(), Ok(5));
}

#[test]
fn named_handlers_run_the_function_of_the_script_that_registered_them() {
    let mut instance = initialized_with(&[
        (
            "main",
            r#"
            import "util" as u;
            fn helper() { print("main helper"); }
            hook_add("t", "main_named", Fn("helper"));
            "#,
        ),
        (
            "util",
            r#"
            fn helper() { print("util helper"); }
            fn shout(n) { "util closure " + n }
            hook_add("t", "named", Fn("helper"));
            hook_add("t", "closure", || { print(shout(3)); });
            "#,
        ),
    ]);
    instance.run_script_hook("t", &[]).expect("t");
    assert_eq!(printed(&instance), vec!["util helper", "util closure 3", "main helper"]);
}

#[test]
fn print_stats_count_lines_per_call_and_in_total() {
    let mut instance = initialized(
        r#"
        hook_add("chatty", "two", || { print("one"); print("two"); });
        hook_add("quiet", "none", || { let x = 1; });
        "#,
    );
    let stats = |instance: &Instance| instance.data_store().get::<PrintStats>("print").cloned().expect("print stats");
    let before = stats(&instance).total_lines;

    instance.run_script_hook("chatty", &[]).expect("chatty");
    let after_chatty = stats(&instance);
    assert_eq!(after_chatty.last_call_lines, 2);
    assert_eq!(after_chatty.total_lines, before + 2);

    instance.run_script_hook("quiet", &[]).expect("quiet");
    let after_quiet = stats(&instance);
    assert_eq!(after_quiet.last_call_lines, 0);
    assert_eq!(after_quiet.total_lines, before + 2);
}
