pub mod date_time;
pub mod fs;
pub mod future;
pub mod hash;
pub mod id_generator;
pub mod panic;
pub mod thread;

pub use id_generator::IdGenerator;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Read a `key=value` command line argument.
pub fn parse_arg(arg_key: &str) -> anyhow::Result<String> {
    parse_arg_from(std::env::args(), arg_key)
}

pub fn parse_arg_with(arg_key: &str, default_value: &str) -> String {
    parse_arg(arg_key).unwrap_or(default_value.to_string())
}

pub(crate) fn parse_arg_from<I>(args: I, arg_key: &str) -> anyhow::Result<String>
where
    I: IntoIterator<Item = String>,
{
    for arg in args {
        let tokens: Vec<&str> = arg.splitn(2, "=").collect();
        if tokens.len() != 2 {
            continue;
        }

        if tokens[0].eq(arg_key) {
            return Ok(tokens[1].to_string());
        }
    }

    Err(anyhow!("`{}` argument is not found", arg_key))
}
