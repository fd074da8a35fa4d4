//! Shared fixtures for unit tests.

use serde_json::json;

use crate::backend::Provisioned;
use crate::graph::Stack;
use crate::resource::{Outputs, Reference, ResourceDeclaration, ResourceKind, StackOutput, Value};

/// `{b1, i1, p1(b1,i1), d1(b1,i1), dep1(b1,d1)}`.
pub fn scenario() -> Vec<ResourceDeclaration> {
    vec![
        ResourceDeclaration::new("b1", ResourceKind::Bucket)
            .with_input("bucketName", "thot-site.com")
            .with_input("websiteIndexDocument", "index.html"),
        ResourceDeclaration::new("i1", ResourceKind::OriginAccessIdentity)
            .with_input("comment", "OAI for thot-site.com"),
        ResourceDeclaration::new("p1", ResourceKind::BucketPolicy)
            .with_input("bucket", Value::reference("b1", "bucketName"))
            .with_input("principal", Value::reference("i1", "canonicalUserId"))
            .with_input("actions", Value::List(vec![Value::literal("s3:GetObject")]))
            .with_input(
                "resources",
                Value::List(vec![Value::Template(vec![
                    crate::resource::Segment::Ref(Reference::new("b1", "arn")),
                    crate::resource::Segment::Text("/*".into()),
                ])]),
            ),
        ResourceDeclaration::new("d1", ResourceKind::Distribution)
            .with_input("originDomainName", Value::reference("b1", "regionalDomainName"))
            .with_input("originAccessIdentity", Value::reference("i1", "identityId"))
            .with_input("certificateArn", "arn:aws:acm:us-east-1:000000000000:certificate/site")
            .with_input("aliases", Value::List(vec![Value::literal("thot-site.com")])),
        ResourceDeclaration::new("dep1", ResourceKind::BucketDeployment)
            .with_input("source", "./public")
            .with_input("destinationBucket", Value::reference("b1", "bucketName"))
            .with_input("distributionId", Value::reference("d1", "distributionId"))
            .with_input("distributionPaths", Value::List(vec![Value::literal("/*")])),
    ]
}

/// Stack outputs over the scenario.
pub fn scenario_outputs() -> Vec<StackOutput> {
    vec![
        StackOutput::new("SiteUrl", Reference::new("d1", "url")),
        StackOutput::new("BucketArn", Reference::new("b1", "arn")),
    ]
}

/// The scenario as a built stack.
pub fn scenario_stack() -> Stack {
    Stack::build(scenario(), scenario_outputs()).expect("scenario stack is valid")
}

/// A backend result carrying every guaranteed output of `kind`.
pub fn fake_provisioned(kind: ResourceKind, logical_id: &str) -> Provisioned {
    let physical_id = format!("{logical_id}-physical");
    let mut outputs = Outputs::new();
    for output in kind.schema().outputs {
        outputs.insert((*output).to_string(), json!(format!("{logical_id}-{output}")));
    }
    outputs.insert(kind.schema().id_output.to_string(), json!(physical_id));
    Provisioned {
        physical_id,
        outputs,
    }
}
