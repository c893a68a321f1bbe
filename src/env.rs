//! Global environment table: parsed once from top-level `KEY=VALUE` lines,
//! read-only for the remainder of the engine's life.

/// Ordered `KEY=VALUE` bindings collected from the top level of a Procfile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalEnv(pub Vec<(String, String)>);

impl GlobalEnv {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Merges inherited process environment, the global env, and a process's
/// inline env, in that precedence order: inherited, then global, then
/// inline, right-wins on key collision.
pub fn merge_env<'a>(
    inherited: impl Iterator<Item = (String, String)>,
    global: &'a GlobalEnv,
    inline: &'a [(String, String)],
) -> Vec<(String, String)> {
    let mut order: Vec<String> = Vec::new();
    let mut values: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    let all = inherited.chain(
        global
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>()
            .into_iter(),
    ).chain(inline.iter().cloned());

    for (k, v) in all {
        if !values.contains_key(&k) {
            order.push(k.clone());
        }
        values.insert(k, v);
    }

    order
        .into_iter()
        .map(|k| {
            let v = values.remove(&k).unwrap();
            (k, v)
        })
        .collect()
}
