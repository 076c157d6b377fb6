use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const INGRESS_CLASS: &str = "nginx";
const WEBAPP_PORT: i32 = 80;

/// The service the platform chart exposes its web app on.
pub fn webapp_service(release: &str, chart: &str) -> String {
    format!("{release}-{chart}-webapp-svc")
}

/// Routes every path of each host to the web app. With no hosts, a single
/// rule matches any host.
pub fn build_ingress(name: &str, namespace: &str, service: &str, hosts: &[String]) -> Ingress {
    let rule = |host: Option<&String>| IngressRule {
        host: host.cloned(),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_owned()),
                path_type: "Prefix".to_owned(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service.to_owned(),
                        port: Some(ServiceBackendPort {
                            number: Some(WEBAPP_PORT),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    };

    let rules = if hosts.is_empty() {
        vec![rule(None)]
    } else {
        hosts.iter().map(|host| rule(Some(host))).collect()
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(crate::k8s::MANAGED_LABELS.clone()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_owned()),
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    }
}
