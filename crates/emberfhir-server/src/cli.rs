use crate::config::{AppConfig, ChatConfig, TenantConfig};
use clap::Parser;

/// Command-line surface of the server binary.
#[derive(Debug, Parser)]
#[command(
    name = "emberfhir-server",
    about = "Multi-tenant in-memory FHIR server with topic-based subscriptions",
    version
)]
pub struct Args {
    /// Listen address, host:port.
    #[arg(long, default_value = "0.0.0.0:5826")]
    pub listen: String,

    /// Tenant spec, repeatable:
    /// name:version:base-url[:loadDir][:maxResources]
    #[arg(long = "tenant")]
    pub tenant: Vec<String>,

    /// Require SMART authorization for the named tenant; repeatable.
    #[arg(long = "smart-required")]
    pub smart_required: Vec<String>,

    /// Chat webhook site URL.
    #[arg(long = "chat-site", env = "CHAT_SITE")]
    pub chat_site: Option<String>,

    /// Chat webhook bot identity.
    #[arg(long = "chat-id", env = "CHAT_IDENTITY")]
    pub chat_id: Option<String>,

    /// Chat webhook API key.
    #[arg(long = "chat-key", env = "CHAT_KEY")]
    pub chat_key: Option<String>,
}

/// Turn parsed arguments into a validated configuration. When no tenant is
/// given, one default tenant per protocol version is created.
pub fn build_config(args: Args) -> Result<AppConfig, String> {
    let mut tenants = Vec::new();
    if args.tenant.is_empty() {
        for name in ["r4", "r4b", "r5"] {
            tenants.push(TenantConfig {
                name: name.to_string(),
                version: name.to_uppercase(),
                base_url: format!("http://{}/{name}", args.listen),
                load_directory: None,
                max_resources: 0,
                smart_required: false,
                protect_loaded: false,
            });
        }
    } else {
        for spec in &args.tenant {
            tenants.push(parse_tenant_spec(spec)?);
        }
    }

    for name in &args.smart_required {
        let Some(tenant) = tenants.iter_mut().find(|t| &t.name == name) else {
            return Err(format!("--smart-required names unknown tenant '{name}'"));
        };
        tenant.smart_required = true;
    }

    let config = AppConfig {
        listen: args.listen,
        tenants,
        chat: ChatConfig {
            site: args.chat_site,
            identity: args.chat_id,
            key: args.chat_key,
        },
    };
    config.validate()?;
    Ok(config)
}

/// Parse `name:version:base-url[:loadDir][:maxResources]`.
///
/// The base URL itself contains colons, so the scheme and an optional
/// `port/path` token are re-joined before the trailing options are read.
fn parse_tenant_spec(spec: &str) -> Result<TenantConfig, String> {
    let tokens: Vec<&str> = spec.split(':').collect();
    if tokens.len() < 3 {
        return Err(format!(
            "tenant spec '{spec}' does not match name:version:base-url[:loadDir][:maxResources]"
        ));
    }
    let name = tokens[0].to_string();
    let version = tokens[1].to_string();

    let rest = &tokens[2..];
    let mut consumed = 1;
    let mut base_url = rest[0].to_string();
    if matches!(rest[0], "http" | "https") {
        let Some(host) = rest.get(1).filter(|t| t.starts_with("//")) else {
            return Err(format!("tenant spec '{spec}' has a malformed base url"));
        };
        base_url = format!("{}:{}", rest[0], host);
        consumed = 2;
        // A digit-leading token after a bare `//host` is the port (plus
        // any path); once the host token already carries a path, trailing
        // tokens are options, not port.
        if !host[2..].contains('/')
            && let Some(port) = rest
                .get(2)
                .filter(|t| t.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
        {
            base_url = format!("{base_url}:{port}");
            consumed = 3;
        }
    }

    let mut load_directory = None;
    let mut max_resources = 0;
    match &rest[consumed..] {
        [] => {}
        [single] => {
            if let Ok(max) = single.parse::<usize>() {
                max_resources = max;
            } else {
                load_directory = Some(single.into());
            }
        }
        [dir, max] => {
            load_directory = Some(dir.into());
            max_resources = max
                .parse::<usize>()
                .map_err(|_| format!("tenant spec '{spec}': maxResources '{max}' is not a number"))?;
        }
        extra => {
            return Err(format!(
                "tenant spec '{spec}' has {} unexpected trailing fields",
                extra.len().saturating_sub(2)
            ));
        }
    }

    Ok(TenantConfig {
        name,
        version,
        base_url,
        load_directory,
        max_resources,
        smart_required: false,
        protect_loaded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_spec() {
        let tenant = parse_tenant_spec("r4:R4:http://localhost:5826/r4").unwrap();
        assert_eq!(tenant.name, "r4");
        assert_eq!(tenant.version, "R4");
        assert_eq!(tenant.base_url, "http://localhost:5826/r4");
        assert!(tenant.load_directory.is_none());
        assert_eq!(tenant.max_resources, 0);
    }

    #[test]
    fn spec_with_load_dir_and_cap() {
        let tenant = parse_tenant_spec("demo:R5:http://fhir.example.org/demo:./data:100").unwrap();
        assert_eq!(tenant.base_url, "http://fhir.example.org/demo");
        assert_eq!(tenant.load_directory.as_deref().unwrap().to_str(), Some("./data"));
        assert_eq!(tenant.max_resources, 100);
    }

    #[test]
    fn spec_with_port_and_load_dir() {
        let tenant = parse_tenant_spec("x:R4:http://h:8080/f:./d").unwrap();
        assert_eq!(tenant.base_url, "http://h:8080/f");
        assert_eq!(tenant.load_directory.as_deref().unwrap().to_str(), Some("./d"));
    }

    #[test]
    fn spec_with_cap_only() {
        let tenant = parse_tenant_spec("x:R4:http://h/f:25").unwrap();
        assert_eq!(tenant.base_url, "http://h/f");
        assert_eq!(tenant.max_resources, 25);
        assert!(tenant.load_directory.is_none());
    }

    #[test]
    fn malformed_specs_fail() {
        assert!(parse_tenant_spec("justname").is_err());
        assert!(parse_tenant_spec("a:R4").is_err());
        assert!(parse_tenant_spec("a:R4:http:broken").is_err());
    }

    #[test]
    fn default_tenants_when_none_given() {
        let args = Args::parse_from(["emberfhir-server", "--listen", "127.0.0.1:5826"]);
        let config = build_config(args).unwrap();
        let names: Vec<&str> = config.tenants.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["r4", "r4b", "r5"]);
        assert_eq!(config.tenants[0].base_url, "http://127.0.0.1:5826/r4");
    }

    #[test]
    fn smart_required_flags_a_tenant() {
        let args = Args::parse_from([
            "emberfhir-server",
            "--listen",
            "127.0.0.1:5826",
            "--tenant",
            "secure:R4:http://localhost:5826/secure",
            "--smart-required",
            "secure",
        ]);
        let config = build_config(args).unwrap();
        assert!(config.tenants[0].smart_required);
    }

    #[test]
    fn smart_required_for_unknown_tenant_fails() {
        let args = Args::parse_from([
            "emberfhir-server",
            "--listen",
            "127.0.0.1:5826",
            "--tenant",
            "a:R4:http://localhost:5826/a",
            "--smart-required",
            "missing",
        ]);
        assert!(build_config(args).is_err());
    }
}
