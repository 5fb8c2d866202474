use std::sync::OnceLock;

use regex::Regex;

/// Expand `${VAR}` and `${VAR:-default}` placeholders in a raw YAML string
///
/// When a default is provided and the variable is unset, the default is
/// used instead of returning an error. Expansion operates on the raw text
/// before deserialization, so config structs use plain String/SecretString.
/// Lines starting with `#` (YAML comments) are passed through unchanged.
pub fn expand_env(input: &str) -> Result<String, String> {
    fn re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        // Group 1: variable name, group 2: optional `:-` default
        RE.get_or_init(|| {
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("must be valid regex")
        })
    }

    let mut output = String::with_capacity(input.len());

    for (i, line) in input.lines().enumerate() {
        if i > 0 {
            output.push('\n');
        }

        // Skip expansion for comment lines
        if line.trim_start().starts_with('#') {
            output.push_str(line);
            continue;
        }

        let mut result = String::with_capacity(line.len());
        let mut last_end = 0;

        for captures in re().captures_iter(line) {
            let overall = captures.get(0).expect("capture 0 always present");
            let var_name = captures.get(1).expect("group 1 always present").as_str();
            let default_value = captures.get(2).map(|m| m.as_str());

            result.push_str(&line[last_end..overall.start()]);

            match std::env::var(var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => match default_value {
                    Some(default) => result.push_str(default),
                    None => {
                        return Err(format!("environment variable not found: `{var_name}`"));
                    }
                },
            }

            last_end = overall.end();
        }

        result.push_str(&line[last_end..]);
        output.push_str(&result);
    }

    // Preserve trailing newline if present
    if input.ends_with('\n') {
        output.push('\n');
    }

    Ok(output)
}
