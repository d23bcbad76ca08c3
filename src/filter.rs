
use crate::error::MulticastError;
use crate::family::RecordType;
use crate::membership::SocketId;
use crate::srcset::SourceList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Include,
    Exclude,
}

/// One socket's requested reception state for a group on an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketMembership<A> {
    pub socket: SocketId,
    pub mode: FilterMode,
    pub sources: SourceList<A>,
}

/// A state-change record produced by recomputing the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChange<A> {
    pub record_type: RecordType,
    pub sources: SourceList<A>,
}

/// Interface-wide reception filter for one group: the merge of every
/// contributing socket membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter<A> {
    mode: FilterMode,
    sources: SourceList<A>,
    contributors: Vec<SocketMembership<A>>,
}

impl<A> Default for DeviceFilter<A> {
    fn default() -> Self {
        Self {
            mode: FilterMode::Include,
            sources: SourceList::default(),
            contributors: Vec::new(),
        }
    }
}

impl<A> DeviceFilter<A>
where
    A: Copy + Eq,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn sources(&self) -> &SourceList<A> {
        &self.sources
    }

    pub fn contributors(&self) -> &[SocketMembership<A>] {
        &self.contributors
    }

    pub fn contributor(&self, socket: SocketId) -> Option<&SocketMembership<A>> {
        self.contributors.iter().find(|m| m.socket == socket)
    }

    /// Whether traffic from `source` passes this filter.
    pub fn accepts(&self, source: &A) -> bool {
        let listed = self.sources.contains(source);
        match self.mode {
            FilterMode::Include => listed,
            FilterMode::Exclude => !listed,
        }
    }

    /// MODE_IS_INCLUDE / MODE_IS_EXCLUDE record describing the current state.
    pub fn current_state(&self) -> FilterChange<A> {
        let record_type = match self.mode {
            FilterMode::Include => RecordType::ModeIsInclude,
            FilterMode::Exclude => RecordType::ModeIsExclude,
        };
        FilterChange { record_type, sources: self.sources.clone() }
    }

    /// Sources from a source-specific query that should be reported as wanted.
    pub fn wanted_sources(&self, queried: &SourceList<A>) -> SourceList<A> {
        match self.mode {
            FilterMode::Include => self.sources.intersection(queried),
            FilterMode::Exclude => queried.difference(&self.sources),
        }
    }

    /// Adds a contributor and recomputes. Nothing changes on error.
    pub fn join(&mut self, membership: SocketMembership<A>) -> Result<Vec<FilterChange<A>>, MulticastError> {
        if self.contributor(membership.socket).is_some() {
            return Err(MulticastError::InvalidParameter);
        }
        self.contributors.push(membership);
        let result = self.recompute();
        if result.is_err() {
            self.contributors.pop();
        }
        result
    }

    /// Removes a contributor and recomputes against the remaining ones.
    /// The last leave resets the filter to INCLUDE {}.
    ///
    /// A leave always succeeds for a contributor. When the remaining INCLUDE
    /// lists no longer fit in one source list, the aggregate widens to
    /// EXCLUDE {}, which accepts every source any of them asked for.
    pub fn leave(&mut self, socket: SocketId) -> Result<Vec<FilterChange<A>>, MulticastError> {
        let index = self.contributors.iter().position(|m| m.socket == socket)
            .ok_or(MulticastError::NotAGroupMember)?;
        self.contributors.remove(index);

        if self.contributors.is_empty() {
            self.mode = FilterMode::Include;
            self.sources.clear();
            return Ok(vec![FilterChange {
                record_type: RecordType::ChangeToInclude,
                sources: SourceList::new(),
            }]);
        }

        let (mode, sources) = Self::aggregate(&self.contributors)
            .unwrap_or((FilterMode::Exclude, SourceList::new()));
        Ok(self.replace(mode, sources))
    }

    /// Replaces a contributor's requested state and recomputes.
    pub fn update(&mut self, socket: SocketId, mode: FilterMode, sources: SourceList<A>) -> Result<Vec<FilterChange<A>>, MulticastError> {
        let membership = self.contributors.iter_mut().find(|m| m.socket == socket)
            .ok_or(MulticastError::NotAGroupMember)?;
        let previous = std::mem::replace(membership, SocketMembership { socket, mode, sources });

        let result = self.recompute();
        if result.is_err() {
            if let Some(membership) = self.contributors.iter_mut().find(|m| m.socket == socket) {
                *membership = previous;
            }
        }
        result
    }

    /// Folds all contributors into a fresh aggregate and reports what changed.
    ///
    /// The stored aggregate is only replaced when the fold succeeds.
    pub fn recompute(&mut self) -> Result<Vec<FilterChange<A>>, MulticastError> {
        let (mode, sources) = Self::aggregate(&self.contributors)?;
        Ok(self.replace(mode, sources))
    }

    fn replace(&mut self, mode: FilterMode, sources: SourceList<A>) -> Vec<FilterChange<A>> {
        let changes = Self::diff(self.mode, &self.sources, mode, &sources);
        self.mode = mode;
        self.sources = sources;
        changes
    }

    fn aggregate(contributors: &[SocketMembership<A>]) -> Result<(FilterMode, SourceList<A>), MulticastError> {
        let mut mode = FilterMode::Include;
        let mut sources = SourceList::new();
        for (i, membership) in contributors.iter().enumerate() {
            if i == 0 {
                mode = membership.mode;
                sources = membership.sources.clone();
                continue;
            }
            let (new_mode, new_sources) = match (mode, membership.mode) {
                (FilterMode::Include, FilterMode::Include) => {
                    (FilterMode::Include, sources.union(&membership.sources)?)
                }
                (FilterMode::Include, FilterMode::Exclude) => {
                    (FilterMode::Exclude, membership.sources.difference(&sources))
                }
                (FilterMode::Exclude, FilterMode::Include) => {
                    (FilterMode::Exclude, sources.difference(&membership.sources))
                }
                (FilterMode::Exclude, FilterMode::Exclude) => {
                    (FilterMode::Exclude, sources.intersection(&membership.sources))
                }
            };
            mode = new_mode;
            sources = new_sources;
        }
        Ok((mode, sources))
    }

    fn diff(old_mode: FilterMode, old: &SourceList<A>, new_mode: FilterMode, new: &SourceList<A>) -> Vec<FilterChange<A>> {
        let mut changes = Vec::new();
        match (old_mode, new_mode) {
            (FilterMode::Include, FilterMode::Exclude) => {
                changes.push(FilterChange { record_type: RecordType::ChangeToExclude, sources: new.clone() });
            }
            (FilterMode::Exclude, FilterMode::Include) => {
                changes.push(FilterChange { record_type: RecordType::ChangeToInclude, sources: new.clone() });
            }
            (FilterMode::Include, FilterMode::Include) => {
                let allowed = new.difference(old);
                let blocked = old.difference(new);
                if !allowed.is_empty() {
                    changes.push(FilterChange { record_type: RecordType::AllowNewSources, sources: allowed });
                }
                if !blocked.is_empty() {
                    changes.push(FilterChange { record_type: RecordType::BlockOldSources, sources: blocked });
                }
            }
            (FilterMode::Exclude, FilterMode::Exclude) => {
                // sources leaving the exclude list become allowed
                let allowed = old.difference(new);
                let blocked = new.difference(old);
                if !allowed.is_empty() {
                    changes.push(FilterChange { record_type: RecordType::AllowNewSources, sources: allowed });
                }
                if !blocked.is_empty() {
                    changes.push(FilterChange { record_type: RecordType::BlockOldSources, sources: blocked });
                }
            }
        }
        changes
    }
}
