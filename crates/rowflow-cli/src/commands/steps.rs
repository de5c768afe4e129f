use rowflow_engine::StepRegistry;

/// Execute the `steps` command: list built-in step types.
pub fn execute() {
    let registry = StepRegistry::with_builtins();
    for (name, description) in registry.describe() {
        println!("{name:16} {description}");
    }
}
