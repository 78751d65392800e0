/// Id-level lifecycle, orthogonal to the version counter.
///
/// ```text
///  Absent --create--> Active --delete--> Deleted
///                       ^                  |
///                       +-----update-------+   (resurrection)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdState {
    Absent,
    Active { latest: u64 },
    Deleted { latest: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateViolation {
    NotFound,
    AlreadyExists,
    VersionMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePlan {
    pub version: u64,
    /// Clear the tombstone on every existing row before inserting.
    pub resurrect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePlan {
    /// Set the tombstone on every existing row.
    Tombstone,
    AlreadyDeleted,
}

impl IdState {
    pub fn latest(&self) -> Option<u64> {
        match self {
            Self::Absent => None,
            Self::Active { latest } | Self::Deleted { latest } => Some(*latest),
        }
    }

    pub fn on_create(self) -> Result<u64, StateViolation> {
        match self {
            Self::Absent => Ok(1),
            _ => Err(StateViolation::AlreadyExists),
        }
    }

    pub fn on_update(self, expected: Option<u64>) -> Result<UpdatePlan, StateViolation> {
        let (latest, resurrect) = match self {
            Self::Absent => return Err(StateViolation::NotFound),
            Self::Active { latest } => (latest, false),
            Self::Deleted { latest } => (latest, true),
        };
        if let Some(expected) = expected {
            if expected != latest {
                return Err(StateViolation::VersionMismatch {
                    expected,
                    actual: latest,
                });
            }
        }
        Ok(UpdatePlan {
            version: latest + 1,
            resurrect,
        })
    }

    pub fn on_delete(self) -> Result<DeletePlan, StateViolation> {
        match self {
            Self::Absent => Err(StateViolation::NotFound),
            Self::Active { .. } => Ok(DeletePlan::Tombstone),
            Self::Deleted { .. } => Ok(DeletePlan::AlreadyDeleted),
        }
    }
}
