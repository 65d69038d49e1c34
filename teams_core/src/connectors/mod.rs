// Microsoft Teams over Microsoft Graph
pub mod teams;
