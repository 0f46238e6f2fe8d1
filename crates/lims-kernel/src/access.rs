//! Actor scope and role checks

use crate::error::LimsError;
use crate::types::{Actor, Sample};
use lims_conformity::{Parameter, Permission};

/// Actor must belong to the sample's organization and hold `permission`
pub(crate) fn authorize(actor: &Actor, sample: &Sample, permission: Permission) -> Result<(), LimsError> {
    ensure_scope(actor, sample)?;
    require(actor, permission)
}

/// Actor must belong to the sample's organization
pub(crate) fn ensure_scope(actor: &Actor, sample: &Sample) -> Result<(), LimsError> {
    if actor.organization_id == sample.organization_id {
        Ok(())
    } else {
        Err(LimsError::Forbidden {
            actor_id: actor.id,
            action: format!("access sample {} of another organization", sample.code),
        })
    }
}

/// Actor's role must hold `permission`
pub(crate) fn require(actor: &Actor, permission: Permission) -> Result<(), LimsError> {
    if actor.role.may(permission) {
        Ok(())
    } else {
        Err(LimsError::Forbidden {
            actor_id: actor.id,
            action: format!("{permission:?} as {}", actor.role),
        })
    }
}

/// Parameter must be visible to the actor's role
pub(crate) fn ensure_visible(actor: &Actor, parameter: &Parameter) -> Result<(), LimsError> {
    if actor.role.sees(parameter.category) {
        Ok(())
    } else {
        Err(LimsError::Forbidden {
            actor_id: actor.id,
            action: format!("record {} results as {}", parameter.code, actor.role),
        })
    }
}
