use std::collections::BTreeMap;

use kube::api::ListParams;

pub fn get_agent_labels(node_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "fabedge".to_owned()),
        ("app.kubernetes.io/component".to_owned(), "agent".to_owned()),
        ("app.kubernetes.io/instance".to_owned(), node_name.to_owned()),
        (
            "app.kubernetes.io/managed-by".to_owned(),
            "fabedge-operator".to_owned(),
        ),
    ])
}

pub fn get_joined_agent_labels(node_name: &str) -> String {
    format!(
        "app.kubernetes.io/name=fabedge,\
            app.kubernetes.io/component=agent,\
            app.kubernetes.io/instance={node_name},\
            app.kubernetes.io/managed-by=fabedge-operator"
    )
}

pub fn get_agent_listparams(node_name: &str) -> ListParams {
    ListParams::default().labels(&get_joined_agent_labels(node_name))
}

pub fn get_connector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "fabedge".to_owned()),
        (
            "app.kubernetes.io/component".to_owned(),
            "connector".to_owned(),
        ),
        (
            "app.kubernetes.io/managed-by".to_owned(),
            "fabedge-operator".to_owned(),
        ),
    ])
}

pub fn get_operator_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "fabedge".to_owned()),
        (
            "app.kubernetes.io/component".to_owned(),
            "operator".to_owned(),
        ),
        (
            "app.kubernetes.io/managed-by".to_owned(),
            "fabedge-operator".to_owned(),
        ),
    ])
}
