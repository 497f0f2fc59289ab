//! Repository exploration calls requested by the context collector.
//!
//! The generator asks for calls as text such as `browse_folder("src", 2)`.
//! Only names and arities in [`CONTEXT_APIS`] are accepted.

/// Declared exploration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiSpec {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

pub const CONTEXT_APIS: &[ApiSpec] = &[
    ApiSpec {
        name: "browse_folder",
        params: &["path", "depth"],
    },
    ApiSpec {
        name: "browse_file_for_environment_info",
        params: &["file_path", "custom_query"],
    },
    ApiSpec {
        name: "search_files_by_keyword",
        params: &["keyword"],
    },
];

/// A validated exploration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    BrowseFolder { path: String, depth: usize },
    BrowseFile { file_path: String, query: String },
    SearchKeyword { keyword: String },
}

/// Parse and validate one call string against [`CONTEXT_APIS`].
pub fn parse_api_call(raw: &str) -> Result<ApiCall, String> {
    let raw = raw.trim();
    let open = raw
        .find('(')
        .ok_or_else(|| format!("`{raw}` is not a call expression"))?;
    if !raw.ends_with(')') {
        return Err(format!("`{raw}` is missing a closing parenthesis"));
    }
    let name = raw[..open].trim();
    let spec = CONTEXT_APIS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| format!("unknown api `{name}`"))?;
    let args = split_args(&raw[open + 1..raw.len() - 1]);
    if args.len() != spec.params.len() {
        return Err(format!(
            "`{name}` takes {} argument(s) ({}), got {}",
            spec.params.len(),
            spec.params.join(", "),
            args.len()
        ));
    }
    let arg = |idx: usize| named_or_positional(&args[idx], spec.params[idx]);
    match spec.name {
        "browse_folder" => {
            let depth = arg(1)
                .parse()
                .map_err(|_| format!("browse_folder depth must be an integer, got `{}`", arg(1)))?;
            Ok(ApiCall::BrowseFolder {
                path: arg(0),
                depth,
            })
        }
        "browse_file_for_environment_info" => Ok(ApiCall::BrowseFile {
            file_path: arg(0),
            query: arg(1),
        }),
        _ => Ok(ApiCall::SearchKeyword { keyword: arg(0) }),
    }
}

fn split_args(inner: &str) -> Vec<String> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in inner.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '"' | '\'') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, ',') => args.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    args.push(current);
    args.into_iter().map(|arg| arg.trim().to_string()).collect()
}

/// Accept `name=value` for the expected parameter name, then unquote.
fn named_or_positional(arg: &str, param: &str) -> String {
    let value = arg
        .strip_prefix(param)
        .and_then(|rest| rest.trim_start().strip_prefix('='))
        .unwrap_or(arg)
        .trim();
    unquote(value).to_string()
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
