use std::borrow::Cow;

use testcontainers::core::{Image, WaitFor};

/// Root password configured on the test SSH server.
pub const ROOT_PASSWORD: &str = "RootPass!123";
/// Unprivileged sudo user and its password, for exercising askpass.
pub const SUDO_USER: &str = "deploy";
pub const SUDO_PASSWORD: &str = "Deploy!Pass123";

/// A helper SSH server container based on Debian Slim, with password
/// authentication and a sudo-enabled unprivileged user.
#[derive(Debug, Clone, Default)]
pub struct SshServer;

impl Image for SshServer {
    fn name(&self) -> &str {
        "debian"
    }

    fn tag(&self) -> &str {
        "12-slim"
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        // Wait until SSH server is listening (logs to stderr with -e)
        vec![WaitFor::message_on_stderr("Server listening on")]
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<Item = (impl Into<Cow<'_, str>>, impl Into<Cow<'_, str>>)> {
        // Prevent interactive prompts during apt-get
        vec![(
            Cow::Borrowed("DEBIAN_FRONTEND"),
            Cow::Borrowed("noninteractive"),
        )]
    }

    fn cmd(&self) -> impl IntoIterator<Item = impl Into<Cow<'_, str>>> {
        let script = format!(
            "apt-get update && apt-get install -y openssh-server sudo procps && \
apt-get clean && rm -rf /var/lib/apt/lists/* && \
mkdir -p /var/run/sshd && \
echo 'root:{root_password}' | chpasswd && \
useradd -m -s /bin/sh {sudo_user} && \
echo '{sudo_user}:{sudo_password}' | chpasswd && \
usermod -aG sudo {sudo_user} && \
sed -i 's/#PermitRootLogin prohibit-password/PermitRootLogin yes/' /etc/ssh/sshd_config && \
sed -i 's/#PasswordAuthentication yes/PasswordAuthentication yes/' /etc/ssh/sshd_config && \
/usr/sbin/sshd -D -e",
            root_password = ROOT_PASSWORD,
            sudo_user = SUDO_USER,
            sudo_password = SUDO_PASSWORD,
        );
        vec![
            Cow::Borrowed("sh"),
            Cow::Borrowed("-c"),
            Cow::Owned(script),
        ]
    }
}
