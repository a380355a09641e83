pub mod ingress;
pub mod template;
