//! Resource kinds and their input/output schemas.
//!
//! Every kind declares which inputs it accepts (and their types), which
//! outputs it guarantees once provisioned, and which output carries the
//! physical identifier used for later updates and deletion.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::value::Value;

/// The kinds of resources a stack can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Storage container for the site assets.
    Bucket,
    /// TLS certificate.
    Certificate,
    /// CDN origin access identity.
    OriginAccessIdentity,
    /// Access policy attached to a bucket.
    BucketPolicy,
    /// CDN distribution.
    Distribution,
    /// Asset upload followed by a CDN invalidation.
    BucketDeployment,
    /// Serverless function.
    Function,
    /// Public URL in front of a function.
    FunctionUrl,
}

/// Expected type of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// A string, a reference, or a template.
    String,
    /// A boolean.
    Bool,
    /// A number.
    Number,
    /// A list whose items are all strings.
    StringList,
    /// Anything, including maps.
    Any,
}

/// Schema entry for one input.
#[derive(Debug, Clone, Copy)]
pub struct InputSpec {
    /// Input name.
    pub name: &'static str,
    /// Expected type.
    pub ty: ValueType,
    /// Whether the input must be declared.
    pub required: bool,
}

/// Schema of a resource kind.
#[derive(Debug)]
pub struct KindSchema {
    /// Accepted inputs.
    pub inputs: &'static [InputSpec],
    /// Outputs guaranteed after provisioning.
    pub outputs: &'static [&'static str],
    /// Output holding the physical identifier.
    pub id_output: &'static str,
}

const fn req(name: &'static str, ty: ValueType) -> InputSpec {
    InputSpec {
        name,
        ty,
        required: true,
    }
}

const fn opt(name: &'static str, ty: ValueType) -> InputSpec {
    InputSpec {
        name,
        ty,
        required: false,
    }
}

static BUCKET: KindSchema = KindSchema {
    inputs: &[
        req("bucketName", ValueType::String),
        opt("websiteIndexDocument", ValueType::String),
        opt("websiteErrorDocument", ValueType::String),
        opt("publicReadAccess", ValueType::Bool),
        opt("blockPublicAccess", ValueType::Any),
        opt("removalPolicy", ValueType::String),
        opt("autoDeleteObjects", ValueType::Bool),
    ],
    outputs: &["arn", "bucketName", "websiteEndpoint", "regionalDomainName"],
    id_output: "bucketName",
};

static CERTIFICATE: KindSchema = KindSchema {
    inputs: &[
        req("domainName", ValueType::String),
        opt("validation", ValueType::String),
        opt("subjectAlternativeNames", ValueType::StringList),
    ],
    outputs: &["certificateId", "arn"],
    id_output: "arn",
};

static ORIGIN_ACCESS_IDENTITY: KindSchema = KindSchema {
    inputs: &[opt("comment", ValueType::String)],
    outputs: &["identityId", "canonicalUserId"],
    id_output: "identityId",
};

static BUCKET_POLICY: KindSchema = KindSchema {
    inputs: &[
        req("bucket", ValueType::String),
        req("actions", ValueType::StringList),
        req("resources", ValueType::StringList),
        req("principal", ValueType::String),
    ],
    outputs: &["policyId"],
    id_output: "policyId",
};

static DISTRIBUTION: KindSchema = KindSchema {
    inputs: &[
        req("originDomainName", ValueType::String),
        req("originAccessIdentity", ValueType::String),
        req("certificateArn", ValueType::String),
        opt("aliases", ValueType::StringList),
        opt("sslMethod", ValueType::String),
        opt("securityPolicy", ValueType::String),
        opt("defaultRootObject", ValueType::String),
        opt("allowedMethods", ValueType::StringList),
        opt("compress", ValueType::Bool),
    ],
    outputs: &["distributionId", "domainName", "url"],
    id_output: "distributionId",
};

static BUCKET_DEPLOYMENT: KindSchema = KindSchema {
    inputs: &[
        req("source", ValueType::String),
        req("destinationBucket", ValueType::String),
        opt("distributionId", ValueType::String),
        opt("distributionPaths", ValueType::StringList),
    ],
    outputs: &["deploymentId", "invalidationId"],
    id_output: "deploymentId",
};

static FUNCTION: KindSchema = KindSchema {
    inputs: &[
        req("code", ValueType::String),
        req("runtime", ValueType::String),
        req("handler", ValueType::String),
        opt("functionName", ValueType::String),
        opt("memorySize", ValueType::Number),
        opt("timeoutSecs", ValueType::Number),
        opt("environment", ValueType::Any),
    ],
    outputs: &["arn", "functionName"],
    id_output: "functionName",
};

static FUNCTION_URL: KindSchema = KindSchema {
    inputs: &[
        req("function", ValueType::String),
        opt("authType", ValueType::String),
        opt("cors", ValueType::Any),
    ],
    outputs: &["url", "urlId"],
    id_output: "urlId",
};

impl ResourceKind {
    /// All known kinds.
    pub const ALL: [Self; 8] = [
        Self::Bucket,
        Self::Certificate,
        Self::OriginAccessIdentity,
        Self::BucketPolicy,
        Self::Distribution,
        Self::BucketDeployment,
        Self::Function,
        Self::FunctionUrl,
    ];

    /// Returns the schema of this kind.
    #[must_use]
    pub const fn schema(self) -> &'static KindSchema {
        match self {
            Self::Bucket => &BUCKET,
            Self::Certificate => &CERTIFICATE,
            Self::OriginAccessIdentity => &ORIGIN_ACCESS_IDENTITY,
            Self::BucketPolicy => &BUCKET_POLICY,
            Self::Distribution => &DISTRIBUTION,
            Self::BucketDeployment => &BUCKET_DEPLOYMENT,
            Self::Function => &FUNCTION,
            Self::FunctionUrl => &FUNCTION_URL,
        }
    }

    /// Returns the kebab-case name used in stack files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::Certificate => "certificate",
            Self::OriginAccessIdentity => "origin-access-identity",
            Self::BucketPolicy => "bucket-policy",
            Self::Distribution => "distribution",
            Self::BucketDeployment => "bucket-deployment",
            Self::Function => "function",
            Self::FunctionUrl => "function-url",
        }
    }

    /// Looks a kind up by its kebab-case name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl KindSchema {
    /// Looks up an input by name.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    /// Returns true if the kind guarantees this output.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains(&name)
    }

    /// Iterates over required inputs.
    pub fn required_inputs(&self) -> impl Iterator<Item = &InputSpec> {
        self.inputs.iter().filter(|spec| spec.required)
    }
}

impl ValueType {
    /// Returns true if `value` is acceptable for this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_stringish(),
            Self::Bool => matches!(value, Value::Bool(_)),
            Self::Number => matches!(value, Value::Number(_)),
            Self::StringList => match value {
                Value::List(items) => items.iter().all(Value::is_stringish),
                _ => false,
            },
        }
    }

    /// Returns the type name for error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::StringList => "list of strings",
            Self::Any => "any",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip_through_serde() {
        for kind in ResourceKind::ALL {
            let yaml = serde_yaml::to_string(&kind).unwrap();
            let parsed: ResourceKind = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(parsed, kind);
            assert_eq!(ResourceKind::from_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_id_output_is_a_guaranteed_output() {
        for kind in ResourceKind::ALL {
            let schema = kind.schema();
            assert!(schema.has_output(schema.id_output), "{kind}");
        }
    }

    #[test]
    fn test_value_type_acceptance() {
        assert!(ValueType::String.accepts(&Value::reference("a", "b")));
        assert!(!ValueType::String.accepts(&Value::Bool(true)));
        assert!(ValueType::StringList.accepts(&Value::List(vec![Value::literal("/*")])));
        assert!(!ValueType::StringList.accepts(&Value::List(vec![Value::Bool(false)])));
        assert!(ValueType::Any.accepts(&Value::Map(std::collections::BTreeMap::new())));
    }
}
