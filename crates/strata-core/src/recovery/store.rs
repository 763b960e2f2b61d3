//! Persistence for recovery plans and their execution reports.

use super::error::RecoveryError;
use super::plan::RecoveryPlan;
use super::report::PlanExecutionReport;

/// Recovery plan store backed by a sled tree.
///
/// Plans live under `plan:<id>` and the latest execution report of each plan
/// under `execution:<id>`, both JSON-encoded.
pub struct RecoveryPlanStore {
    tree: sled::Tree,
}

impl RecoveryPlanStore {
    /// Tree name for recovery plans.
    pub const TREE_NAME: &'static str = "recovery:plans";

    const PLAN_PREFIX: &'static str = "plan:";
    const EXECUTION_PREFIX: &'static str = "execution:";

    /// Open or create the plan store.
    pub fn open(db: &sled::Db) -> Result<Self, RecoveryError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Save a plan, replacing any plan with the same id.
    pub fn save_plan(&self, plan: &RecoveryPlan) -> Result<(), RecoveryError> {
        let value = serde_json::to_vec(plan)?;
        self.tree.insert(Self::plan_key(&plan.id), value)?;
        Ok(())
    }

    /// Load a plan.
    pub fn load_plan(&self, id: &str) -> Result<Option<RecoveryPlan>, RecoveryError> {
        match self.tree.get(Self::plan_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all plans, oldest first.
    pub fn list_plans(&self) -> Result<Vec<RecoveryPlan>, RecoveryError> {
        let mut plans = Vec::new();
        for item in self.tree.scan_prefix(Self::PLAN_PREFIX) {
            let (_, value) = item?;
            let plan: RecoveryPlan = serde_json::from_slice(&value)?;
            plans.push(plan);
        }
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Delete a plan and its execution report.
    pub fn delete_plan(&self, id: &str) -> Result<bool, RecoveryError> {
        let existed = self.tree.remove(Self::plan_key(id))?.is_some();
        self.tree.remove(Self::execution_key(id))?;
        Ok(existed)
    }

    /// Save the execution report of a plan.
    pub fn save_execution(&self, report: &PlanExecutionReport) -> Result<(), RecoveryError> {
        let value = serde_json::to_vec(report)?;
        self.tree
            .insert(Self::execution_key(&report.plan_id), value)?;
        Ok(())
    }

    /// Load the latest execution report of a plan.
    pub fn load_execution(
        &self,
        plan_id: &str,
    ) -> Result<Option<PlanExecutionReport>, RecoveryError> {
        match self.tree.get(Self::execution_key(plan_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), RecoveryError> {
        self.tree.flush()?;
        Ok(())
    }

    fn plan_key(id: &str) -> Vec<u8> {
        format!("{}{}", Self::PLAN_PREFIX, id).into_bytes()
    }

    fn execution_key(id: &str) -> Vec<u8> {
        format!("{}{}", Self::EXECUTION_PREFIX, id).into_bytes()
    }
}
