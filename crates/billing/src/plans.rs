//! Plan catalog
//!
//! Static table of what each tier includes: the modules it unlocks and the
//! numeric quota limits. `-1` ([`UNLIMITED`]) means no limit. Nothing here
//! is mutated at runtime.

use std::fmt;
use std::str::FromStr;

use gradewise_shared::SubscriptionTier;
use serde::{Deserialize, Serialize};

use crate::error::BillingError;

/// Sentinel limit value meaning "no limit"
pub const UNLIMITED: i64 = -1;

/// Countable resource subject to a per-owner limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaKey {
    Courses,
    Assignments,
    AiGrades,
    PlagiarismScans,
    Students,
    MonthlyCredits,
}

impl QuotaKey {
    pub const ALL: [QuotaKey; 6] = [
        QuotaKey::Courses,
        QuotaKey::Assignments,
        QuotaKey::AiGrades,
        QuotaKey::PlagiarismScans,
        QuotaKey::Students,
        QuotaKey::MonthlyCredits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKey::Courses => "courses",
            QuotaKey::Assignments => "assignments",
            QuotaKey::AiGrades => "aiGrades",
            QuotaKey::PlagiarismScans => "plagiarismScans",
            QuotaKey::Students => "students",
            QuotaKey::MonthlyCredits => "monthlyCredits",
        }
    }

    /// Column in `usage_counters`
    pub fn column(&self) -> &'static str {
        match self {
            QuotaKey::Courses => "courses",
            QuotaKey::Assignments => "assignments",
            QuotaKey::AiGrades => "ai_grades",
            QuotaKey::PlagiarismScans => "plagiarism_scans",
            QuotaKey::Students => "students",
            QuotaKey::MonthlyCredits => "monthly_credits",
        }
    }

    /// Counters cleared by the monthly period reset. Courses, assignments and
    /// students are standing totals.
    pub fn resets_each_period(&self) -> bool {
        matches!(
            self,
            QuotaKey::AiGrades | QuotaKey::PlagiarismScans | QuotaKey::MonthlyCredits
        )
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaKey {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuotaKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| BillingError::InvalidRequest(format!("unknown quota key {}", s)))
    }
}

/// Gated capability. This is the complete allow-list: anything else is
/// rejected with `UNKNOWN_MODULE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleKey {
    Courses,
    Assignments,
    AiGrading,
    PlagiarismDetection,
    BulkEnrollment,
    Analytics,
    AiAssistant,
    BrowserExtension,
    LmsIntegration,
    CustomBranding,
}

impl ModuleKey {
    pub const ALL: [ModuleKey; 10] = [
        ModuleKey::Courses,
        ModuleKey::Assignments,
        ModuleKey::AiGrading,
        ModuleKey::PlagiarismDetection,
        ModuleKey::BulkEnrollment,
        ModuleKey::Analytics,
        ModuleKey::AiAssistant,
        ModuleKey::BrowserExtension,
        ModuleKey::LmsIntegration,
        ModuleKey::CustomBranding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKey::Courses => "COURSES",
            ModuleKey::Assignments => "ASSIGNMENTS",
            ModuleKey::AiGrading => "AI_GRADING",
            ModuleKey::PlagiarismDetection => "PLAGIARISM_DETECTION",
            ModuleKey::BulkEnrollment => "BULK_ENROLLMENT",
            ModuleKey::Analytics => "ANALYTICS",
            ModuleKey::AiAssistant => "AI_ASSISTANT",
            ModuleKey::BrowserExtension => "BROWSER_EXTENSION",
            ModuleKey::LmsIntegration => "LMS_INTEGRATION",
            ModuleKey::CustomBranding => "CUSTOM_BRANDING",
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKey {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleKey::ALL
            .into_iter()
            .find(|module| module.as_str() == s)
            .ok_or_else(|| BillingError::UnknownModule(s.to_string()))
    }
}

/// Numeric limits for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub courses: i64,
    pub assignments: i64,
    pub ai_grades: i64,
    pub plagiarism_scans: i64,
    pub students: i64,
    pub monthly_credits: i64,
}

impl QuotaLimits {
    pub fn get(&self, key: QuotaKey) -> i64 {
        match key {
            QuotaKey::Courses => self.courses,
            QuotaKey::Assignments => self.assignments,
            QuotaKey::AiGrades => self.ai_grades,
            QuotaKey::PlagiarismScans => self.plagiarism_scans,
            QuotaKey::Students => self.students,
            QuotaKey::MonthlyCredits => self.monthly_credits,
        }
    }
}

const FREE_TRIAL_MODULES: &[ModuleKey] = &[
    ModuleKey::Courses,
    ModuleKey::Assignments,
    ModuleKey::AiGrading,
];

const BASIC_MODULES: &[ModuleKey] = &[
    ModuleKey::Courses,
    ModuleKey::Assignments,
    ModuleKey::AiGrading,
    ModuleKey::PlagiarismDetection,
    ModuleKey::BulkEnrollment,
];

const PREMIUM_MODULES: &[ModuleKey] = &[
    ModuleKey::Courses,
    ModuleKey::Assignments,
    ModuleKey::AiGrading,
    ModuleKey::PlagiarismDetection,
    ModuleKey::BulkEnrollment,
    ModuleKey::Analytics,
    ModuleKey::AiAssistant,
    ModuleKey::BrowserExtension,
];

const ENTERPRISE_MODULES: &[ModuleKey] = &ModuleKey::ALL;

/// Catalog entry for a tier
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub tier: SubscriptionTier,
    pub modules: &'static [ModuleKey],
    pub limits: QuotaLimits,
}

impl Plan {
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::FreeTrial => Self {
                tier,
                modules: FREE_TRIAL_MODULES,
                limits: QuotaLimits {
                    courses: 1,
                    assignments: 10,
                    ai_grades: 50,
                    plagiarism_scans: 0,
                    students: 30,
                    monthly_credits: 100,
                },
            },
            SubscriptionTier::Basic => Self {
                tier,
                modules: BASIC_MODULES,
                limits: QuotaLimits {
                    courses: 5,
                    assignments: 100,
                    ai_grades: 500,
                    plagiarism_scans: 50,
                    students: 150,
                    monthly_credits: 1_000,
                },
            },
            SubscriptionTier::Premium => Self {
                tier,
                modules: PREMIUM_MODULES,
                limits: QuotaLimits {
                    courses: 25,
                    assignments: UNLIMITED,
                    ai_grades: 5_000,
                    plagiarism_scans: 500,
                    students: 1_000,
                    monthly_credits: 10_000,
                },
            },
            SubscriptionTier::Enterprise => Self {
                tier,
                modules: ENTERPRISE_MODULES,
                limits: QuotaLimits {
                    courses: UNLIMITED,
                    assignments: UNLIMITED,
                    ai_grades: UNLIMITED,
                    plagiarism_scans: UNLIMITED,
                    students: UNLIMITED,
                    monthly_credits: UNLIMITED,
                },
            },
        }
    }

    pub fn includes(&self, module: ModuleKey) -> bool {
        self.modules.contains(&module)
    }

    pub fn limit(&self, key: QuotaKey) -> i64 {
        self.limits.get(key)
    }

    /// Lowest tier whose plan includes `module`
    pub fn minimum_tier_for(module: ModuleKey) -> SubscriptionTier {
        SubscriptionTier::ALL
            .into_iter()
            .find(|tier| Plan::for_tier(*tier).includes(module))
            .unwrap_or(SubscriptionTier::Enterprise)
    }
}

/// True when raising `current` by `increment` stays within `limit`
pub fn within_limit(limit: i64, current: i64, increment: i64) -> bool {
    limit == UNLIMITED || current.saturating_add(increment) <= limit
}
