use super::{CacheConfig, ParamType, ParameterDef, QueryBody, QueryDefinition};
use crate::{catalog::DataSource, mapper::FieldMapping, query::SearchScope};
use serde_json::json;

const AD_USERS: &str = "(&(objectCategory=person)(objectClass=user))";
const AD_COMPUTERS: &str = "(objectCategory=computer)";
/// LDAP_MATCHING_RULE_BIT_AND
const BIT_AND: &str = "1.2.840.113556.1.4.803";

const AD_USER_FIELDS: &[(&str, &str)] = &[
    ("sAMAccountName", "username"),
    ("displayName", "displayName"),
    ("mail", "email"),
    ("department", "department"),
    ("title", "title"),
    ("lastLogonTimestamp", "lastLogon"),
];

const GRAPH_USER_FIELDS: &[(&str, &str)] = &[
    ("displayName", "displayName"),
    ("userPrincipalName", "userPrincipalName"),
    ("mail", "mail"),
    ("department", "department"),
    ("accountEnabled", "accountEnabled"),
];

pub(super) fn definitions() -> Vec<QueryDefinition> {
    let mut all = directory();
    all.extend(azure());
    all.extend(office365());
    all.extend(application());
    all
}

fn directory() -> Vec<QueryDefinition> {
    vec![
        QueryDefinition {
            parameters: vec![days(90)],
            ..def(
                "inactive_users",
                "Inactive Users",
                "Enabled users whose replicated last logon is older than the given number of days",
                "security",
                DataSource::Ad,
                ldap(
                    &format!(
                        "(&{AD_USERS}(!(userAccountControl:{BIT_AND}:=2))\
                         (|(!(lastLogonTimestamp=*))(lastLogonTimestamp<={{{{days|filetime_days_ago}}}})))"
                    ),
                    &with(AD_USER_FIELDS, &[("whenCreated", "whenCreated")]),
                ),
                &with(AD_USER_FIELDS, &[("whenCreated", "whenCreated")]),
            )
        },
        def(
            "disabled_users",
            "Disabled Users",
            "User accounts with the ACCOUNTDISABLE flag set",
            "security",
            DataSource::Ad,
            ldap(
                &format!("(&{AD_USERS}(userAccountControl:{BIT_AND}:=2))"),
                &with(AD_USER_FIELDS, &[("whenChanged", "whenChanged")]),
            ),
            &with(AD_USER_FIELDS, &[("whenChanged", "whenChanged")]),
        ),
        def(
            "locked_users",
            "Locked Out Users",
            "Users currently or recently locked out after failed logons",
            "security",
            DataSource::Ad,
            ldap(
                &format!("(&{AD_USERS}(lockoutTime>=1))"),
                &with(
                    AD_USER_FIELDS,
                    &[("lockoutTime", "lockoutTime"), ("badPwdCount", "badPasswordCount")],
                ),
            ),
            &with(
                AD_USER_FIELDS,
                &[("lockoutTime", "lockoutTime"), ("badPwdCount", "badPasswordCount")],
            ),
        ),
        def(
            "password_never_expires",
            "Password Never Expires",
            "Users exempt from password expiry (DONT_EXPIRE_PASSWORD)",
            "security",
            DataSource::Ad,
            ldap(
                &format!("(&{AD_USERS}(userAccountControl:{BIT_AND}:=65536))"),
                &with(AD_USER_FIELDS, &[("pwdLastSet", "passwordLastSet")]),
            ),
            &with(AD_USER_FIELDS, &[("pwdLastSet", "passwordLastSet")]),
        ),
        QueryDefinition {
            parameters: vec![days(90)],
            ..def(
                "password_expiry",
                "Stale Passwords",
                "Users whose password was last set more than the given number of days ago",
                "security",
                DataSource::Ad,
                ldap(
                    &format!(
                        "(&{AD_USERS}(!(userAccountControl:{BIT_AND}:=2))\
                         (pwdLastSet>=1)(pwdLastSet<={{{{days|filetime_days_ago}}}}))"
                    ),
                    &with(AD_USER_FIELDS, &[("pwdLastSet", "passwordLastSet")]),
                ),
                &with(AD_USER_FIELDS, &[("pwdLastSet", "passwordLastSet")]),
            )
        },
        def(
            "privileged_users",
            "Privileged Users",
            "Accounts protected by AdminSDHolder (adminCount=1)",
            "security",
            DataSource::Ad,
            ldap(
                &format!("(&{AD_USERS}(adminCount=1))"),
                &with(AD_USER_FIELDS, &[("memberOf", "memberOf")]),
            ),
            &with(AD_USER_FIELDS, &[("memberOf", "memberOf")]),
        ),
        QueryDefinition {
            parameters: vec![ParameterDef::new(
                "groupDn",
                "Group Distinguished Name",
                ParamType::string(512),
            )
            .required()
            .describe("e.g. CN=Domain Admins,CN=Users,DC=corp,DC=example")],
            ..def(
                "group_members",
                "Group Members",
                "Direct user members of a group",
                "membership",
                DataSource::Ad,
                ldap(
                    &format!("(&{AD_USERS}(memberOf={{{{groupDn}}}}))"),
                    AD_USER_FIELDS,
                ),
                AD_USER_FIELDS,
            )
        },
        QueryDefinition {
            parameters: vec![days(30)],
            ..def(
                "recently_created_users",
                "Recently Created Users",
                "Users created within the given number of days",
                "lifecycle",
                DataSource::Ad,
                ldap(
                    &format!("(&{AD_USERS}(whenCreated>={{{{days|generalized_days_ago}}}}))"),
                    &with(AD_USER_FIELDS, &[("whenCreated", "whenCreated")]),
                ),
                &with(AD_USER_FIELDS, &[("whenCreated", "whenCreated")]),
            )
        },
        QueryDefinition {
            parameters: vec![days(90)],
            ..def(
                "inactive_computers",
                "Inactive Computers",
                "Computer accounts that have not authenticated within the given number of days",
                "computers",
                DataSource::Ad,
                ldap(
                    &format!(
                        "(&{AD_COMPUTERS}(lastLogonTimestamp<={{{{days|filetime_days_ago}}}}))"
                    ),
                    COMPUTER_FIELDS,
                ),
                COMPUTER_FIELDS,
            )
        },
    ]
}

const COMPUTER_FIELDS: &[(&str, &str)] = &[
    ("cn", "name"),
    ("dNSHostName", "dnsHostName"),
    ("operatingSystem", "operatingSystem"),
    ("operatingSystemVersion", "operatingSystemVersion"),
    ("lastLogonTimestamp", "lastLogon"),
];

fn azure() -> Vec<QueryDefinition> {
    vec![
        QueryDefinition {
            parameters: vec![days(90)],
            cache: ttl(900),
            ..def(
                "graph_inactive_users",
                "Inactive Users (Entra ID)",
                "Users without an interactive sign-in within the given number of days",
                "security",
                DataSource::Azure,
                graph(
                    "users",
                    Some("signInActivity/lastSignInDateTime le {{days|iso_days_ago}}"),
                    &with(
                        GRAPH_USER_FIELDS,
                        &[("signInActivity/lastSignInDateTime", "lastSignIn")],
                    ),
                    true,
                ),
                &with(
                    GRAPH_USER_FIELDS,
                    &[("signInActivity/lastSignInDateTime", "lastSignIn")],
                ),
            )
        },
        QueryDefinition {
            cache: ttl(900),
            ..def(
                "graph_guest_users",
                "Guest Users",
                "External (B2B) guest accounts",
                "security",
                DataSource::Azure,
                graph(
                    "users",
                    Some("userType eq 'Guest'"),
                    &with(
                        GRAPH_USER_FIELDS,
                        &[("userType", "userType"), ("createdDateTime", "createdDateTime")],
                    ),
                    false,
                ),
                &with(
                    GRAPH_USER_FIELDS,
                    &[("userType", "userType"), ("createdDateTime", "createdDateTime")],
                ),
            )
        },
        def(
            "graph_disabled_users",
            "Disabled Users (Entra ID)",
            "Accounts with sign-in blocked",
            "security",
            DataSource::Azure,
            graph("users", Some("accountEnabled eq false"), GRAPH_USER_FIELDS, false),
            GRAPH_USER_FIELDS,
        ),
        QueryDefinition {
            parameters: vec![ParameterDef::new(
                "department",
                "Department",
                ParamType::string(128),
            )
            .required()],
            ..def(
                "graph_users_by_department",
                "Users by Department",
                "Users in a department",
                "organization",
                DataSource::Azure,
                graph(
                    "users",
                    Some("department eq {{department}}"),
                    &with(GRAPH_USER_FIELDS, &[("jobTitle", "jobTitle")]),
                    false,
                ),
                &with(GRAPH_USER_FIELDS, &[("jobTitle", "jobTitle")]),
            )
        },
        QueryDefinition {
            parameters: vec![days(90)],
            ..def(
                "graph_stale_devices",
                "Stale Devices",
                "Devices without a sign-in within the given number of days",
                "devices",
                DataSource::Azure,
                graph(
                    "devices",
                    Some("approximateLastSignInDateTime le {{days|iso_days_ago}}"),
                    DEVICE_FIELDS,
                    true,
                ),
                DEVICE_FIELDS,
            )
        },
        def(
            "graph_security_groups",
            "Security Groups",
            "Security-enabled groups",
            "groups",
            DataSource::Azure,
            graph(
                "groups",
                Some("securityEnabled eq true"),
                &[
                    ("displayName", "displayName"),
                    ("description", "description"),
                    ("mailEnabled", "mailEnabled"),
                    ("groupTypes", "groupTypes"),
                    ("createdDateTime", "createdDateTime"),
                ],
                false,
            ),
            &[
                ("displayName", "displayName"),
                ("description", "description"),
                ("mailEnabled", "mailEnabled"),
                ("groupTypes", "groupTypes"),
                ("createdDateTime", "createdDateTime"),
            ],
        ),
    ]
}

const DEVICE_FIELDS: &[(&str, &str)] = &[
    ("displayName", "displayName"),
    ("operatingSystem", "operatingSystem"),
    ("trustType", "trustType"),
    ("isCompliant", "isCompliant"),
    ("approximateLastSignInDateTime", "approximateLastSignIn"),
];

const LICENSE_FIELDS: &[(&str, &str)] = &[
    ("displayName", "displayName"),
    ("userPrincipalName", "userPrincipalName"),
    ("usageLocation", "usageLocation"),
    ("assignedLicenses", "assignedLicenses"),
];

const MAILBOX_FIELDS: &[(&str, &str)] = &[
    ("userPrincipalName", "userPrincipalName"),
    ("displayName", "displayName"),
    ("itemCount", "itemCount"),
    ("storageUsedInBytes", "storageUsedInBytes"),
    ("prohibitSendQuotaInBytes", "prohibitSendQuotaInBytes"),
    ("lastActivityDate", "lastActivityDate"),
];

fn office365() -> Vec<QueryDefinition> {
    vec![
        QueryDefinition {
            cache: ttl(1800),
            ..def(
                "o365_licensed_users",
                "Licensed Users",
                "Users with at least one license assigned",
                "licensing",
                DataSource::O365,
                graph("users", Some("assignedLicenses/$count ne 0"), LICENSE_FIELDS, true),
                LICENSE_FIELDS,
            )
        },
        QueryDefinition {
            cache: ttl(1800),
            ..def(
                "o365_unlicensed_users",
                "Unlicensed Users",
                "Enabled users without any license",
                "licensing",
                DataSource::O365,
                graph(
                    "users",
                    Some("assignedLicenses/$count eq 0 and accountEnabled eq true"),
                    LICENSE_FIELDS,
                    true,
                ),
                LICENSE_FIELDS,
            )
        },
        QueryDefinition {
            parameters: vec![ParameterDef::new(
                "period",
                "Reporting Period",
                ParamType::one_of(&["D7", "D30", "D90", "D180"]),
            )
            .with_default(json!("D30"))],
            cache: ttl(3600),
            ..def(
                "o365_mailbox_usage",
                "Mailbox Usage",
                "Per-mailbox storage and activity",
                "usage",
                DataSource::O365,
                graph(
                    "reports/getMailboxUsageDetail(period='{{period|raw}}')",
                    None,
                    &[],
                    false,
                ),
                MAILBOX_FIELDS,
            )
        },
        def(
            "o365_teams",
            "Teams",
            "Microsoft 365 groups provisioned as Teams",
            "collaboration",
            DataSource::O365,
            graph(
                "groups",
                Some("resourceProvisioningOptions/Any(x:x eq 'Team')"),
                &[
                    ("displayName", "displayName"),
                    ("mail", "mail"),
                    ("visibility", "visibility"),
                    ("createdDateTime", "createdDateTime"),
                ],
                false,
            ),
            &[
                ("displayName", "displayName"),
                ("mail", "mail"),
                ("visibility", "visibility"),
                ("createdDateTime", "createdDateTime"),
            ],
        ),
    ]
}

const HISTORY_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("query_id", "queryId"),
    ("user_id", "userId"),
    ("data_source", "dataSource"),
    ("status", "status"),
    ("row_count", "rowCount"),
    ("execution_time_ms", "executionTimeMs"),
    ("started_at", "startedAt"),
];

fn application() -> Vec<QueryDefinition> {
    vec![
        QueryDefinition {
            parameters: vec![days(7)],
            cache: ttl(60),
            ..def(
                "recent_executions",
                "Recent Report Executions",
                "Report executions started within the given number of days",
                "audit",
                DataSource::Postgres,
                QueryBody::Sql {
                    text: "SELECT id, query_id, user_id, data_source, status, row_count, \
                           execution_time_ms, started_at FROM report_history \
                           WHERE started_at >= NOW() - make_interval(days => :days::int) \
                           ORDER BY started_at DESC"
                        .to_string(),
                },
                HISTORY_FIELDS,
            )
        },
        QueryDefinition {
            parameters: vec![days(7)],
            cache: ttl(60),
            ..def(
                "failed_executions",
                "Failed Report Executions",
                "Failed report executions with their error",
                "audit",
                DataSource::Postgres,
                QueryBody::Sql {
                    text: "SELECT id, query_id, user_id, data_source, status, error, \
                           started_at FROM report_history \
                           WHERE status = 'failed' \
                           AND started_at >= NOW() - make_interval(days => :days::int) \
                           ORDER BY started_at DESC"
                        .to_string(),
                },
                &[
                    ("id", "id"),
                    ("query_id", "queryId"),
                    ("user_id", "userId"),
                    ("data_source", "dataSource"),
                    ("error", "error"),
                    ("started_at", "startedAt"),
                ],
            )
        },
        QueryDefinition {
            parameters: vec![ParameterDef::new("active", "Active", ParamType::Boolean)
                .with_default(json!(true))],
            ..def(
                "application_users",
                "Application Users",
                "Users of the reporting application",
                "audit",
                DataSource::Postgres,
                QueryBody::Sql {
                    text: "SELECT username, email, display_name, role, last_login FROM users \
                           WHERE is_active = :active ORDER BY username"
                        .to_string(),
                },
                &[
                    ("username", "username"),
                    ("email", "email"),
                    ("display_name", "displayName"),
                    ("role", "role"),
                    ("last_login", "lastLogin"),
                ],
            )
        },
    ]
}

fn def(
    id: &str,
    name: &str,
    description: &str,
    category: &str,
    data_source: DataSource,
    body: QueryBody,
    fields: &[(&str, &str)],
) -> QueryDefinition {
    QueryDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        data_source,
        parameters: Vec::new(),
        body,
        field_mapping: fields
            .iter()
            .map(|(source, target)| FieldMapping::new(source, target))
            .collect(),
        cache: CacheConfig::default(),
        requires_auth: true,
        max_results: None,
        owner_id: None,
        is_public: true,
    }
}

fn ldap(filter: &str, fields: &[(&str, &str)]) -> QueryBody {
    QueryBody::Ldap {
        filter: filter.to_string(),
        attributes: fields.iter().map(|(source, _)| source.to_string()).collect(),
        scope: SearchScope::Sub,
        base_dn: None,
        size_limit: None,
    }
}

fn graph(endpoint: &str, filter: Option<&str>, fields: &[(&str, &str)], advanced: bool) -> QueryBody {
    let mut select: Vec<String> = Vec::new();
    for (source, _) in fields {
        let root = source.split('/').next().unwrap_or(source).to_string();
        if !select.contains(&root) {
            select.push(root);
        }
    }
    QueryBody::Graph {
        endpoint: endpoint.to_string(),
        select,
        filter: filter.map(str::to_string),
        order_by: None,
        top: None,
        expand: None,
        advanced,
    }
}

fn with<'a>(base: &[(&'a str, &'a str)], extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    base.iter().chain(extra).copied().collect()
}

fn days(default: i64) -> ParameterDef {
    ParameterDef::new("days", "Days", ParamType::integer(1, 3650))
        .required()
        .with_default(json!(default))
        .describe("Look-back window in days")
}

fn ttl(seconds: u64) -> CacheConfig {
    CacheConfig {
        enabled: true,
        ttl_seconds: Some(seconds),
    }
}
