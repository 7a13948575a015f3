use reqwest::Method;

/// Path parameters that define a rate-limit bucket's identity on top of
/// the server-assigned hash. Requests on the same template but different
/// major parameters are limited independently.
const MAJOR_PARAMS: [&str; 3] = ["channel_id", "guild_id", "webhook_id"];

/// An API route template, e.g. `GET /channels/{channel_id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub method: Method,
    pub path_template: &'static str,
}

impl Route {
    pub fn new(method: Method, path_template: &'static str) -> Self {
        Self { method, path_template }
    }

    /// Substitute `{name}` placeholders with concrete values, capturing
    /// the major parameters for bucket identity as we go.
    pub fn compile(&self, params: &[(&str, &str)]) -> CompiledRoute {
        let mut path = self.path_template.to_string();
        let mut major = Vec::new();
        for (name, value) in params {
            path = path.replace(&format!("{{{name}}}"), value);
            if MAJOR_PARAMS.contains(name) {
                major.push((*value).to_string());
            }
        }
        CompiledRoute {
            route: self.clone(),
            compiled_path: path,
            major_param_hash: if major.is_empty() {
                "-".to_string()
            } else {
                major.join("-")
            },
        }
    }
}

/// A route with its parameters substituted, ready to be sent.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub route: Route,
    pub compiled_path: String,
    pub major_param_hash: String,
}

impl CompiledRoute {
    pub fn method(&self) -> &Method {
        &self.route.method
    }

    pub fn create_url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.compiled_path)
    }

    /// Key under which the bucket hash learned for this template is
    /// remembered. Shared by every compiled instance of the template.
    pub fn template_key(&self) -> String {
        format!("{} {}", self.route.method, self.route.path_template)
    }

    /// The real bucket key: the server's hash qualified by the major
    /// parameters, so two channels never share a live bucket even when
    /// the server assigns their template the same hash.
    pub fn bucket_key(&self, initial_hash: &str) -> String {
        format!("{};{}", initial_hash, self.major_param_hash)
    }
}
