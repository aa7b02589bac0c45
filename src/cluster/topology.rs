//! cluster/topology — роли узлов базы и детерминированный выбор владельца задачи.
//!
//! Роли (списки попарно не пересекаются):
//! - members     — полноправные реплики (только они "enabled" для задач);
//! - promotables — догоняющие, ещё не члены;
//! - rehabs      — члены, временно разжалованные после сбоя;
//! - watchers    — только приём.
//!
//! Выбор владельца: кандидаты = отсортированное объединение members/promotables/rehabs;
//! jump hash по ключу; попали в выключенного — убираем его из рабочей копии,
//! перемешиваем ключ (mix64) и пробуем снова. Не больше `candidates` попыток.

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::KeelError;
use crate::hash::{jump_consistent_hash, mix64, task_key};
use crate::metrics::record_owner_resolution;

use super::changes::{ReplicationKind, ReplicationNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Member,
    Promotable,
    Rehab,
    Watcher,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Member => "member",
            NodeRole::Promotable => "promotable",
            NodeRole::Rehab => "rehab",
            NodeRole::Watcher => "watcher",
        };
        f.write_str(s)
    }
}

/// Состояние узла в консенсусе; задачи раздаются только вне Passive/Candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RachisState {
    Passive,
    Candidate,
    Follower,
    LeaderElect,
    Leader,
}

impl RachisState {
    pub fn assigns_tasks(self) -> bool {
        !matches!(self, RachisState::Passive | RachisState::Candidate)
    }
}

impl FromStr for RachisState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "passive" => Ok(RachisState::Passive),
            "candidate" => Ok(RachisState::Candidate),
            "member" | "follower" => Ok(RachisState::Follower),
            "leader-elect" | "leaderelect" => Ok(RachisState::LeaderElect),
            "leader" => Ok(RachisState::Leader),
            other => Err(anyhow::anyhow!(
                "unknown node state '{}' (expected passive|candidate|member|leader)",
                other
            )),
        }
    }
}

/// Что-то, что нужно закрепить за одним узлом (ETL, бэкап, догоняющая реплика).
pub trait DatabaseTask {
    /// Стабильный 64-битный ключ для jump hash.
    fn task_key(&self) -> u64;

    fn task_name(&self) -> String;

    /// Предпочтительный узел, если он член базы.
    fn mentor_node(&self) -> Option<&str> {
        None
    }
}

/// Задача, идентифицируемая именем.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTask {
    pub name: String,
    pub mentor: Option<String>,
}

impl NamedTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mentor: None,
        }
    }

    pub fn with_mentor(mut self, mentor: impl Into<String>) -> Self {
        self.mentor = Some(mentor.into());
        self
    }
}

impl DatabaseTask for NamedTask {
    fn task_key(&self) -> u64 {
        task_key(&self.name)
    }

    fn task_name(&self) -> String {
        self.name.clone()
    }

    fn mentor_node(&self) -> Option<&str> {
        self.mentor.as_deref()
    }
}

/// Догоняющая реплика как задача: кто из членов её "ведёт".
#[derive(Debug, Clone)]
pub struct PromotableTask<'a> {
    pub node_tag: &'a str,
    pub url: &'a str,
    pub database: &'a str,
    pub mentor: Option<&'a str>,
}

impl DatabaseTask for PromotableTask<'_> {
    fn task_key(&self) -> u64 {
        task_key(&format!("{}/{}/{}", self.node_tag, self.database, self.url))
    }

    fn task_name(&self) -> String {
        format!("promotable {} of '{}'", self.node_tag, self.database)
    }

    fn mentor_node(&self) -> Option<&str> {
        self.mentor
    }
}

/// Перебор с исключением выключенных кандидатов.
/// `candidates` должны быть отсортированы: результат не зависит от порядка в записи.
pub fn resolve_owner<F>(task: &str, key: u64, candidates: &[String], is_enabled: F) -> Result<String>
where
    F: Fn(&str) -> bool,
{
    let mut working: Vec<&str> = candidates.iter().map(String::as_str).collect();
    let mut key = key;
    let mut rehashes = 0u64;

    for _ in 0..candidates.len() {
        let idx = jump_consistent_hash(key, working.len() as i32);
        if idx < 0 {
            break;
        }
        let tag = working[idx as usize];
        if is_enabled(tag) {
            record_owner_resolution(rehashes);
            return Ok(tag.to_string());
        }
        debug!("owner of '{}': {} is disabled, rehashing", task, tag);
        working.remove(idx as usize);
        key = mix64(key);
        rehashes += 1;
    }

    record_owner_resolution(rehashes);
    Err(KeelError::NoOwnerAvailable {
        task: task.to_string(),
        candidates: candidates.len(),
    }
    .into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTopology {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub promotables: Vec<String>,
    #[serde(default)]
    pub rehabs: Vec<String>,
    #[serde(default)]
    pub watchers: Vec<String>,
    /// promotable/rehab → член, который её догоняет.
    #[serde(default)]
    pub predefined_mentors: BTreeMap<String, String>,
    #[serde(default)]
    pub priority_order: Vec<String>,
    /// Индекс raft-лога последнего изменения.
    #[serde(default)]
    pub stamp: u64,
}

impl DatabaseTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I, S>(members: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut t = Self::new();
        for m in members {
            t.add(m, NodeRole::Member)?;
        }
        Ok(t)
    }

    pub fn role_of(&self, tag: &str) -> Option<NodeRole> {
        let has = |v: &Vec<String>| v.iter().any(|t| t == tag);
        if has(&self.members) {
            Some(NodeRole::Member)
        } else if has(&self.promotables) {
            Some(NodeRole::Promotable)
        } else if has(&self.rehabs) {
            Some(NodeRole::Rehab)
        } else if has(&self.watchers) {
            Some(NodeRole::Watcher)
        } else {
            None
        }
    }

    fn list_mut(&mut self, role: NodeRole) -> &mut Vec<String> {
        match role {
            NodeRole::Member => &mut self.members,
            NodeRole::Promotable => &mut self.promotables,
            NodeRole::Rehab => &mut self.rehabs,
            NodeRole::Watcher => &mut self.watchers,
        }
    }

    /// Добавить узел в роль. Тег, уже занятый любой ролью, — InvalidTopology.
    pub fn add(&mut self, tag: impl Into<String>, role: NodeRole) -> Result<()> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(KeelError::InvalidTopology("empty node tag".into()).into());
        }
        if let Some(existing) = self.role_of(&tag) {
            return Err(KeelError::InvalidTopology(format!(
                "node {} is already a {}, cannot add it as a {}",
                tag, existing, role
            ))
            .into());
        }
        self.list_mut(role).push(tag);
        Ok(())
    }

    pub fn add_member(&mut self, tag: impl Into<String>) -> Result<()> {
        self.add(tag, NodeRole::Member)
    }

    pub fn add_promotable(&mut self, tag: impl Into<String>) -> Result<()> {
        self.add(tag, NodeRole::Promotable)
    }

    pub fn add_rehab(&mut self, tag: impl Into<String>) -> Result<()> {
        self.add(tag, NodeRole::Rehab)
    }

    pub fn add_watcher(&mut self, tag: impl Into<String>) -> Result<()> {
        self.add(tag, NodeRole::Watcher)
    }

    /// Убрать узел из любой роли. Возвращает прежнюю роль.
    pub fn remove(&mut self, tag: &str) -> Option<NodeRole> {
        let role = self.role_of(tag)?;
        self.list_mut(role).retain(|t| t != tag);
        self.predefined_mentors.remove(tag);
        self.priority_order.retain(|t| t != tag);
        Some(role)
    }

    /// Перевести узел в другую роль (promotable → member, member → rehab и т.п.).
    pub fn move_to(&mut self, tag: &str, role: NodeRole) -> Result<()> {
        match self.role_of(tag) {
            None => Err(KeelError::InvalidTopology(format!("unknown node {}", tag)).into()),
            Some(r) if r == role => Ok(()),
            Some(r) => {
                self.list_mut(r).retain(|t| t != tag);
                if role == NodeRole::Member {
                    self.predefined_mentors.remove(tag);
                }
                self.list_mut(role).push(tag.to_string());
                Ok(())
            }
        }
    }

    /// Проверка инвариантов (для записей, пришедших из JSON).
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (role, list) in [
            (NodeRole::Member, &self.members),
            (NodeRole::Promotable, &self.promotables),
            (NodeRole::Rehab, &self.rehabs),
            (NodeRole::Watcher, &self.watchers),
        ] {
            for tag in list {
                if !seen.insert(tag.as_str()) {
                    return Err(KeelError::InvalidTopology(format!(
                        "node {} appears more than once (last seen as {})",
                        tag, role
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Кандидаты на задачи: members ∪ promotables ∪ rehabs, отсортированы.
    pub fn all_nodes(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .members
            .iter()
            .chain(&self.promotables)
            .chain(&self.rehabs)
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn count(&self) -> usize {
        self.members.len() + self.promotables.len() + self.rehabs.len()
    }

    pub fn relevant_for(&self, tag: &str) -> bool {
        self.role_of(tag).is_some()
    }

    pub fn is_member(&self, tag: &str) -> bool {
        self.members.iter().any(|t| t == tag)
    }

    /// Владелец задачи без учёта состояния узла.
    pub fn whose_task_is_it(&self, task: &dyn DatabaseTask) -> Result<String> {
        resolve_owner(
            &task.task_name(),
            task.task_key(),
            &self.all_nodes(),
            |tag| self.is_member(tag),
        )
    }

    /// Владелец с учётом состояния узла, ментора и прошлого ответственного.
    /// None — этот узел сейчас задачи не раздаёт.
    pub fn whose_task_is_it_in_state(
        &self,
        state: RachisState,
        task: &dyn DatabaseTask,
        last_responsible: Option<&str>,
    ) -> Result<Option<String>> {
        if !state.assigns_tasks() {
            return Ok(None);
        }
        if let Some(mentor) = task.mentor_node() {
            if self.is_member(mentor) {
                return Ok(Some(mentor.to_string()));
            }
        }
        if let Some(last) = last_responsible {
            if self.is_member(last) {
                return Ok(Some(last.to_string()));
            }
        }
        self.whose_task_is_it(task).map(Some)
    }

    /// Куда реплицировать с узла `node_tag`.
    ///
    /// Все члены, кроме себя, плюс promotable/rehab/watcher, которых ведёт этот узел.
    /// Узлы, с которых база удаляется, пропускаются; если удаляется с самого
    /// `node_tag` — пустой список.
    pub fn get_destinations(
        &self,
        node_tag: &str,
        database_name: &str,
        deletion_in_progress: &BTreeSet<String>,
        cluster_urls: &BTreeMap<String, String>,
        state: RachisState,
    ) -> Vec<ReplicationNode> {
        let mut out = Vec::new();
        if deletion_in_progress.contains(node_tag) {
            return out;
        }
        let url_of = |tag: &str| cluster_urls.get(tag).cloned().unwrap_or_default();

        for member in &self.members {
            if member == node_tag || deletion_in_progress.contains(member) {
                continue;
            }
            out.push(ReplicationNode::new(
                member,
                url_of(member),
                database_name,
                ReplicationKind::Internal,
            ));
        }

        let followers = self
            .promotables
            .iter()
            .chain(&self.rehabs)
            .map(|t| (t, ReplicationKind::Internal))
            .chain(self.watchers.iter().map(|t| (t, ReplicationKind::Watcher)));
        for (tag, kind) in followers {
            if deletion_in_progress.contains(tag) {
                continue;
            }
            let url = url_of(tag);
            let task = PromotableTask {
                node_tag: tag,
                url: &url,
                database: database_name,
                mentor: self.predefined_mentors.get(tag).map(String::as_str),
            };
            match self.whose_task_is_it_in_state(state, &task, None) {
                Ok(Some(owner)) if owner == node_tag => {
                    out.push(ReplicationNode::new(tag, url.clone(), database_name, kind));
                }
                Ok(_) => {}
                Err(e) => debug!("destinations of {}: {} has no owner: {}", node_tag, tag, e),
            }
        }

        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_disjoint() {
        let mut t = DatabaseTopology::with_members(["A", "B"]).unwrap();
        t.add_promotable("C").unwrap();
        let err = t.add_watcher("A").unwrap_err();
        assert!(matches!(
            crate::error::keel_error(&err),
            Some(KeelError::InvalidTopology(_))
        ));
        t.move_to("C", NodeRole::Member).unwrap();
        assert_eq!(t.role_of("C"), Some(NodeRole::Member));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn mentor_member_wins() {
        let t = DatabaseTopology::with_members(["A", "B", "C"]).unwrap();
        let task = NamedTask::new("etl/orders").with_mentor("B");
        let owner = t
            .whose_task_is_it_in_state(RachisState::Follower, &task, Some("C"))
            .unwrap();
        assert_eq!(owner.as_deref(), Some("B"));
        let none = t
            .whose_task_is_it_in_state(RachisState::Passive, &task, None)
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn no_members_means_no_owner() {
        let mut t = DatabaseTopology::new();
        t.add_promotable("A").unwrap();
        t.add_rehab("B").unwrap();
        let err = t.whose_task_is_it(&NamedTask::new("backup")).unwrap_err();
        assert!(matches!(
            crate::error::keel_error(&err),
            Some(KeelError::NoOwnerAvailable { candidates: 2, .. })
        ));
    }
}
