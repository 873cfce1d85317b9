use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// Identity of a controlling owner. The uid disambiguates objects recreated under the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OwnerIdentity {
    pub(crate) kind: String,
    pub(crate) name: String,
    pub(crate) uid: String,
}

pub(crate) fn is_controller_owned_by(owner: &OwnerIdentity, references: &[OwnerReference]) -> bool {
    references.iter().any(|r| {
        r.controller == Some(true)
            && r.kind == owner.kind
            && r.name == owner.name
            && r.uid == owner.uid
    })
}
